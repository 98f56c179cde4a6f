use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use entityflow::{
    facts, EntityRef, InMemoryKnownData, InMemoryStatusStore, KnownData, Orchestrator,
    SchedulerConfig, SchedulerConfigBuilder, Stage, StageCatalog, StageError, StageFuture,
    StageKind, StageRegistry, StageRequest,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub type InvocationLog = Arc<Mutex<Vec<(EntityRef, StageKind)>>>;

pub fn invocation_log() -> InvocationLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Blocks gated stages until [`Gate::open`] is called. Stays open afterwards.
#[derive(Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn closed() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Stage double that logs every invocation and answers with fixed facts or a
/// fixed error.
#[derive(Clone)]
pub struct RecordingStage {
    log: InvocationLog,
    facts: KnownData,
    failure: Option<StageError>,
    first_failure: Arc<Mutex<Option<StageError>>>,
    delay: Duration,
    gate: Option<Gate>,
}

impl RecordingStage {
    pub fn new(log: &InvocationLog) -> Self {
        Self {
            log: log.clone(),
            facts: KnownData::new(),
            failure: None,
            first_failure: Arc::default(),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    pub fn reporting(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.facts.insert(name, value);
        self
    }

    pub fn failing(mut self, error: StageError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Fails the first invocation only; later invocations succeed.
    pub fn failing_once(mut self, error: StageError) -> Self {
        self.first_failure = Arc::new(Mutex::new(Some(error)));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }
}

impl Stage for RecordingStage {
    fn invoke(&self, request: StageRequest) -> StageFuture<'_> {
        Box::pin(async move {
            self.log
                .lock()
                .expect("invocation log poisoned")
                .push((request.entity, request.stage));
            if let Some(gate) = &self.gate {
                gate.pass().await;
            }
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let first_failure = self
                .first_failure
                .lock()
                .expect("first failure poisoned")
                .take();
            if let Some(error) = first_failure {
                return Err(error);
            }
            match &self.failure {
                Some(error) => Err(error.clone()),
                None => Ok(self.facts.clone()),
            }
        })
    }
}

/// Recording stage for every kind; enrollment reports `has_enrollment`.
pub fn recording_registry(log: &InvocationLog) -> StageRegistry {
    StageKind::ALL
        .into_iter()
        .fold(StageRegistry::new(), |registry, kind| {
            let stage = RecordingStage::new(log);
            let stage = if kind == StageKind::Enrollment {
                stage.reporting(facts::HAS_ENROLLMENT, true)
            } else {
                stage
            };
            registry.with(kind, stage)
        })
}

pub fn test_config() -> SchedulerConfigBuilder {
    SchedulerConfig::builder()
        .worker_count(4)
        .queue_capacity(64)
        .stage_timeout(Duration::from_secs(5))
        .metrics_interval(Duration::from_millis(200))
        .bulk_retry_initial_delay(Duration::from_millis(5))
        .bulk_retry_max_delay(Duration::from_millis(50))
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryStatusStore>,
    pub known: Arc<InMemoryKnownData>,
    pub log: InvocationLog,
}

impl Harness {
    pub fn start(
        config: SchedulerConfig,
        registry: StageRegistry,
        log: InvocationLog,
    ) -> Result<Self> {
        let store = Arc::new(InMemoryStatusStore::new());
        let known = Arc::new(InMemoryKnownData::new());
        let orchestrator = Orchestrator::start(
            config,
            StageCatalog::standard()?,
            registry,
            store.clone(),
            known.clone(),
        )?;
        Ok(Self {
            orchestrator,
            store,
            known,
            log,
        })
    }

    pub fn invocations(&self, entity: EntityRef) -> Vec<StageKind> {
        self.log
            .lock()
            .expect("invocation log poisoned")
            .iter()
            .filter(|(invoked, _)| *invoked == entity)
            .map(|(_, stage)| *stage)
            .collect()
    }

    /// Entities in the order the given stage was first invoked for them.
    pub fn entities_invoked(&self, stage: StageKind) -> Vec<EntityRef> {
        self.log
            .lock()
            .expect("invocation log poisoned")
            .iter()
            .filter(|(_, invoked)| *invoked == stage)
            .map(|(entity, _)| *entity)
            .collect()
    }
}

pub async fn wait_until(
    what: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what} did not happen within {:?}", timeout);
        }
        sleep(Duration::from_millis(10)).await;
    }
}
