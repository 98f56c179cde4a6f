use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 3;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_BULK_RETRY_INITIAL_MS: u64 = 100;
const DEFAULT_BULK_RETRY_MAX_MS: u64 = 5_000;
const DEFAULT_BULK_RETRY_ATTEMPTS: usize = 20;

pub const ENV_WORKERS: &str = "ENTITYFLOW_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "ENTITYFLOW_QUEUE_CAPACITY";
pub const ENV_STAGE_TIMEOUT_SECS: &str = "ENTITYFLOW_STAGE_TIMEOUT_SECS";
pub const ENV_METRICS_INTERVAL_SECS: &str = "ENTITYFLOW_METRICS_INTERVAL_SECS";
pub const ENV_REPLAN: &str = "ENTITYFLOW_REPLAN";

/// When the pipeline re-evaluates stage applicability during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplanPolicy {
    /// Re-plan after every executed stage so facts reported mid-run can add
    /// or drop later stages.
    #[default]
    EveryStage,
    /// Keep the plan computed from the facts loaded at run start.
    OnceAtStart,
}

impl FromStr for ReplanPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "every_stage" | "every-stage" => Ok(ReplanPolicy::EveryStage),
            "once" | "once_at_start" => Ok(ReplanPolicy::OnceAtStart),
            other => bail!("unknown replan policy `{other}`; expected every_stage or once"),
        }
    }
}

/// Runtime configuration for the scheduler and its pipeline runner.
///
/// All instances must be constructed via [`SchedulerConfig::builder`] or [`SchedulerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    worker_count: usize,
    queue_capacity: usize,
    stage_timeout: Duration,
    metrics_interval: Duration,
    event_capacity: usize,
    replan_policy: ReplanPolicy,
    bulk_retry_initial_delay: Duration,
    bulk_retry_max_delay: Duration,
    bulk_retry_max_attempts: usize,
}

pub struct SchedulerConfigParams {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub stage_timeout: Duration,
    pub metrics_interval: Duration,
    pub event_capacity: usize,
    pub replan_policy: ReplanPolicy,
    pub bulk_retry_initial_delay: Duration,
    pub bulk_retry_max_delay: Duration,
    pub bulk_retry_max_attempts: usize,
}

impl SchedulerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: SchedulerConfigParams) -> Result<Self> {
        let SchedulerConfigParams {
            worker_count,
            queue_capacity,
            stage_timeout,
            metrics_interval,
            event_capacity,
            replan_policy,
            bulk_retry_initial_delay,
            bulk_retry_max_delay,
            bulk_retry_max_attempts,
        } = params;

        let config = Self {
            worker_count,
            queue_capacity,
            stage_timeout,
            metrics_interval,
            event_capacity,
            replan_policy,
            bulk_retry_initial_delay,
            bulk_retry_max_delay,
            bulk_retry_max_attempts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of tasks processed concurrently.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Maximum number of pending (not yet claimed) tasks.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Upper bound on a single stage invocation.
    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Buffer size of the task event broadcast channel.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    pub fn replan_policy(&self) -> ReplanPolicy {
        self.replan_policy
    }

    /// First delay used when a bulk submission hits a saturated queue.
    pub fn bulk_retry_initial_delay(&self) -> Duration {
        self.bulk_retry_initial_delay
    }

    pub fn bulk_retry_max_delay(&self) -> Duration {
        self.bulk_retry_max_delay
    }

    /// Attempts per entity before a bulk submission counts it as rejected.
    pub fn bulk_retry_max_attempts(&self) -> usize {
        self.bulk_retry_max_attempts
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        if self.stage_timeout.is_zero() {
            bail!("stage_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.event_capacity == 0 {
            bail!("event_capacity must be greater than 0");
        }

        if self.bulk_retry_initial_delay.is_zero() {
            bail!("bulk_retry_initial_delay must be greater than 0");
        }

        if self.bulk_retry_max_delay < self.bulk_retry_initial_delay {
            bail!(
                "bulk_retry_max_delay ({:?}) must not be shorter than bulk_retry_initial_delay ({:?})",
                self.bulk_retry_max_delay,
                self.bulk_retry_initial_delay,
            );
        }

        if self.bulk_retry_max_attempts == 0 {
            bail!("bulk_retry_max_attempts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stage_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            replan_policy: ReplanPolicy::default(),
            bulk_retry_initial_delay: Duration::from_millis(DEFAULT_BULK_RETRY_INITIAL_MS),
            bulk_retry_max_delay: Duration::from_millis(DEFAULT_BULK_RETRY_MAX_MS),
            bulk_retry_max_attempts: DEFAULT_BULK_RETRY_ATTEMPTS,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerConfigBuilder {
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    stage_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    event_capacity: Option<usize>,
    replan_policy: Option<ReplanPolicy>,
    bulk_retry_initial_delay: Option<Duration>,
    bulk_retry_max_delay: Option<Duration>,
    bulk_retry_max_attempts: Option<usize>,
}

impl SchedulerConfigBuilder {
    /// Seeds a builder from the `ENTITYFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Seeds a builder from an arbitrary variable lookup. Unset or blank
    /// variables leave the default in place.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let mut builder = Self::default();
        if let Some(value) = read(ENV_WORKERS) {
            builder.worker_count = Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("{ENV_WORKERS} must be a positive integer"))?,
            );
        }
        if let Some(value) = read(ENV_QUEUE_CAPACITY) {
            builder.queue_capacity = Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("{ENV_QUEUE_CAPACITY} must be a positive integer"))?,
            );
        }
        if let Some(value) = read(ENV_STAGE_TIMEOUT_SECS) {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{ENV_STAGE_TIMEOUT_SECS} must be a number of seconds"))?;
            builder.stage_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(value) = read(ENV_METRICS_INTERVAL_SECS) {
            let secs: u64 = value.parse().with_context(|| {
                format!("{ENV_METRICS_INTERVAL_SECS} must be a number of seconds")
            })?;
            builder.metrics_interval = Some(Duration::from_secs(secs));
        }
        if let Some(value) = read(ENV_REPLAN) {
            builder.replan_policy = Some(
                value
                    .parse::<ReplanPolicy>()
                    .with_context(|| format!("invalid {ENV_REPLAN}"))?,
            );
        }
        Ok(builder)
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn replan_policy(mut self, policy: ReplanPolicy) -> Self {
        self.replan_policy = Some(policy);
        self
    }

    pub fn bulk_retry_initial_delay(mut self, delay: Duration) -> Self {
        self.bulk_retry_initial_delay = Some(delay);
        self
    }

    pub fn bulk_retry_max_delay(mut self, delay: Duration) -> Self {
        self.bulk_retry_max_delay = Some(delay);
        self
    }

    pub fn bulk_retry_max_attempts(mut self, attempts: usize) -> Self {
        self.bulk_retry_max_attempts = Some(attempts);
        self
    }

    pub fn build(self) -> Result<SchedulerConfig> {
        let defaults = SchedulerConfig::default();
        let params = SchedulerConfigParams {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            stage_timeout: self.stage_timeout.unwrap_or(defaults.stage_timeout),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
            replan_policy: self.replan_policy.unwrap_or(defaults.replan_policy),
            bulk_retry_initial_delay: self
                .bulk_retry_initial_delay
                .unwrap_or(defaults.bulk_retry_initial_delay),
            bulk_retry_max_delay: self
                .bulk_retry_max_delay
                .unwrap_or(defaults.bulk_retry_max_delay),
            bulk_retry_max_attempts: self
                .bulk_retry_max_attempts
                .unwrap_or(defaults.bulk_retry_max_attempts),
        };

        SchedulerConfig::new(params)
    }
}
