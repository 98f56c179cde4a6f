use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use entityflow::{
    facts, BulkHandle, BulkSummary, EntityRef, EntityType, FnStage, InMemoryKnownData,
    InMemoryStatusStore, KnownData, Orchestrator, Priority, SchedulerConfigBuilder,
    StageCatalog, StageError, StageKind, StageRegistry, StageRequest, StageResult,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::time::sleep;

const DEFAULT_ENTITY_COUNT: u64 = 200;
const DEFAULT_STAGE_DELAY_MS: u64 = 20;
const DEFAULT_LOG_DIRECTIVE: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    init_demo_tracing();

    let args = DemoArgs::from_env()?;
    let config = SchedulerConfigBuilder::from_env()?.build()?;
    let bar = build_progress_bar(args.entity_count);
    bar.println(format!(
        "Processing {} schools with {} workers",
        args.entity_count,
        config.worker_count()
    ));

    let known = Arc::new(InMemoryKnownData::new());
    for id in 1..=args.entity_count {
        let mut data = KnownData::new().with(facts::HAS_ADDRESS, true);
        if id % 5 == 0 {
            data.insert(facts::TEAM_NAME, format!("team-{}", id % 3));
        }
        known.insert(EntityRef::school(id), data);
    }

    let mut orchestrator = Orchestrator::start(
        config,
        StageCatalog::standard()?,
        simulated_registry(args.stage_delay),
        Arc::new(InMemoryStatusStore::new()),
        known,
    )?;

    let started = Instant::now();
    let bulk = orchestrator.submit_many(1..=args.entity_count, EntityType::School, Priority::Normal);
    track_progress(&bar, &bulk).await;
    let summary = bulk.wait().await;
    bar.finish_with_message("done");

    print_summary(&bar, &summary, started.elapsed());
    let telemetry = serde_json::to_string_pretty(&orchestrator.telemetry())
        .context("failed to render telemetry")?;
    bar.println(telemetry);

    orchestrator.shutdown().await;
    Ok(())
}

fn init_demo_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    entityflow::init_tracing();
}

/// Stages that sleep instead of calling out. Every 17th location lookup fails
/// and even schools report enrollment.
fn simulated_registry(delay: Duration) -> StageRegistry {
    StageKind::ALL
        .into_iter()
        .fold(StageRegistry::new(), |registry, kind| {
            registry.with(
                kind,
                FnStage::new(move |request: StageRequest| simulate(kind, request, delay)),
            )
        })
}

async fn simulate(kind: StageKind, request: StageRequest, delay: Duration) -> StageResult {
    let id = request.entity.id.0;
    sleep(delay + Duration::from_millis(id % 7)).await;
    match kind {
        StageKind::Location if id % 17 == 0 => {
            Err(StageError::transient("geocoder returned no candidates"))
        }
        StageKind::Location => Ok(KnownData::new().with(facts::HAS_LOCATION, true)),
        StageKind::Enrollment => Ok(KnownData::new().with(facts::HAS_ENROLLMENT, id % 2 == 0)),
        _ => Ok(KnownData::new()),
    }
}

async fn track_progress(bar: &ProgressBar, bulk: &BulkHandle) {
    loop {
        let progress = bulk.progress();
        bar.set_position(progress.resolved() as u64);
        bar.set_message(format!(
            "queued {} running {} failed {}",
            progress.queued + progress.awaiting_admission,
            progress.in_flight,
            progress.failed
        ));
        if progress.is_complete() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn build_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stdout_with_hz(12));
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} entities ({per_sec:.2}/s) {msg}",
    )
    .expect("valid progress bar template")
    .progress_chars("=>-");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_summary(bar: &ProgressBar, summary: &BulkSummary, elapsed: Duration) {
    let seconds = elapsed.as_secs_f64();
    let rate = if seconds > 0.0 {
        summary.progress.total as f64 / seconds
    } else {
        0.0
    };
    bar.println(format!(
        "Resolved {} entities in {:.2}s [{:.2}/s]: {} succeeded, {} failed, {} rejected, {} cancelled",
        summary.progress.total,
        seconds,
        rate,
        summary.progress.succeeded,
        summary.progress.failed,
        summary.progress.rejected,
        summary.progress.cancelled
    ));
}

struct DemoArgs {
    entity_count: u64,
    stage_delay: Duration,
}

impl DemoArgs {
    fn from_env() -> Result<Self> {
        let entity_count =
            parse_env_with_default::<u64>("ENTITYFLOW_DEMO_ENTITIES", DEFAULT_ENTITY_COUNT)?;
        let delay_ms =
            parse_env_with_default::<u64>("ENTITYFLOW_DEMO_STAGE_DELAY_MS", DEFAULT_STAGE_DELAY_MS)?;
        ensure!(
            entity_count > 0,
            "ENTITYFLOW_DEMO_ENTITIES must be greater than 0"
        );

        Ok(Self {
            entity_count,
            stage_delay: Duration::from_millis(delay_ms),
        })
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}")),
        Err(_) => Ok(default),
    }
}
