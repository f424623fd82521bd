//! Execution loops.
//!
//! Every selected collector and harvester gets its own tokio task. Tasks
//! share nothing but the store handle, so one failing or panicking
//! component never stops the others. The one exception is a fail-fast
//! collector: its first error ends the whole run.
//!
//! | Mode | Collectors | Harvesters |
//! |------|------------|------------|
//! | [`spawn_loops`] | fire on their schedule | step until deferred, back off, repeat |
//! | [`run_once`] | fire once | one step each |
//! | [`catch_up`] | not run | resolver order, each stepped until deferred |

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use mobility_harvester_core::component::{Collector, Harvester};
use mobility_harvester_core::graph::NodeId;
use mobility_harvester_core::incremental::{harvest_step, HarvestPlan, StepOutcome};
use mobility_harvester_core::range::Schedule;
use mobility_harvester_core::store::{Store, StoreReceipt};

use crate::config::{ComponentSpec, RunnerConfig};
use crate::pipeline::Pipeline;

/// Runtime knobs shared by every loop.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fail_fast: bool,
    pub harvester_backoff: Duration,
}

impl RunOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            fail_fast: config.fail_fast,
            harvester_backoff: Duration::from_secs(config.harvester_backoff_secs),
        }
    }
}

/// Upper bound on steps per harvester in one catch-up run.
const MAX_CATCH_UP_STEPS: usize = 1_000_000;

/// Run a collector once and store its payload at the current Unix second.
pub async fn collect_once(
    store: &dyn Store,
    spec: &ComponentSpec,
    collector: &dyn Collector,
) -> Result<StoreReceipt> {
    let payload = collector
        .run()
        .await
        .with_context(|| format!("collector '{}' failed", spec.name))?;
    payload
        .expect_kind(spec.kind)
        .with_context(|| format!("collector '{}' returned the wrong kind", spec.name))?;
    let timestamp = Utc::now().timestamp();
    let receipt = store
        .store_payload(&spec.name, timestamp, spec.kind, Some(&payload))
        .await
        .with_context(|| format!("collector '{}' could not store its payload", spec.name))?;
    Ok(receipt)
}

fn plan_of(spec: &ComponentSpec) -> Result<HarvestPlan> {
    spec.harvest_plan()
        .with_context(|| format!("'{}' is not a harvester", spec.name))
}

async fn collector_loop(
    store: Arc<dyn Store>,
    spec: ComponentSpec,
    collector: Arc<dyn Collector>,
    fail_fast: bool,
) -> Result<()> {
    let schedule = spec
        .schedule
        .with_context(|| format!("collector '{}' has no schedule", spec.name))?;
    info!(collector = %spec.name, %schedule, "collector started");

    if let Schedule::Daily(_) = schedule {
        tokio::time::sleep(schedule.delay_from(Utc::now())).await;
    }
    loop {
        match collect_once(store.as_ref(), &spec, collector.as_ref()).await {
            Ok(receipt) => info!(
                collector = %spec.name,
                id = receipt.id,
                deduplicated = receipt.deduplicated,
                "collected"
            ),
            Err(e) if fail_fast => return Err(e),
            Err(e) => warn!(collector = %spec.name, "{:#}", e),
        }
        tokio::time::sleep(schedule.delay_from(Utc::now())).await;
    }
}

async fn harvester_loop(
    store: Arc<dyn Store>,
    plan: HarvestPlan,
    harvester: Arc<dyn Harvester>,
    backoff: Duration,
) -> Result<()> {
    info!(harvester = %plan.name, source = %plan.source, range = %plan.source_range, "harvester started");
    loop {
        match harvest_step(store.as_ref(), &plan, harvester.as_ref()).await {
            Ok(StepOutcome::Progress { written, reference }) => {
                debug!(harvester = %plan.name, written, reference, "harvested");
                tokio::task::yield_now().await;
            }
            Ok(StepOutcome::Deferred(reason)) => {
                debug!(harvester = %plan.name, %reason, "deferred");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(harvester = %plan.name, "{}", e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Spawn one task per selected collector and harvester.
///
/// Each task yields its component name and, for fail-fast collectors
/// only, the error that stopped it.
pub fn spawn_loops(
    tasks: &mut JoinSet<(String, Result<()>)>,
    store: &Arc<dyn Store>,
    pipeline: &Pipeline,
    collectors: &[NodeId],
    harvesters: &[NodeId],
    options: &RunOptions,
) -> Result<()> {
    for &id in collectors {
        let spec = pipeline.spec(id).clone();
        let collector = pipeline
            .collector(id)
            .with_context(|| format!("'{}' is not a collector", spec.name))?;
        let fail_fast = spec.fail_fast.unwrap_or(options.fail_fast);
        let store = Arc::clone(store);
        tasks.spawn(async move {
            let name = spec.name.clone();
            (name, collector_loop(store, spec, collector, fail_fast).await)
        });
    }
    for &id in harvesters {
        let spec = pipeline.spec(id);
        let plan = plan_of(spec)?;
        let harvester = pipeline
            .harvester(id)
            .with_context(|| format!("'{}' is not a harvester", spec.name))?;
        let store = Arc::clone(store);
        let backoff = options.harvester_backoff;
        tasks.spawn(async move {
            let name = plan.name.clone();
            (name, harvester_loop(store, plan, harvester, backoff).await)
        });
    }
    Ok(())
}

/// Wait on the running tasks until Ctrl-C, a fail-fast error, or every
/// task has finished. Panicked tasks are logged and the rest keep going.
pub async fn supervise(mut tasks: JoinSet<(String, Result<()>)>) -> Result<()> {
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => break Ok(()),
                Some(Ok((name, Ok(())))) => info!(component = %name, "stopped"),
                Some(Ok((name, Err(e)))) => {
                    error!(component = %name, "{:#}", e);
                    break Err(e.context(format!("'{}' stopped the run", name)));
                }
                Some(Err(e)) if e.is_panic() => error!("component task panicked: {}", e),
                Some(Err(e)) => warn!("component task cancelled: {}", e),
            }
        }
    };
    tasks.shutdown().await;
    result
}

/// What happened to one component in a one-shot run.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub role: &'static str,
    /// Rows written.
    pub written: usize,
    /// Harvester steps that made progress.
    pub steps: usize,
    /// Why the last step did nothing, if it did nothing.
    pub deferred: Option<String>,
    pub error: Option<String>,
}

impl ComponentReport {
    fn new(name: &str, role: &'static str) -> Self {
        Self {
            name: name.to_string(),
            role,
            written: 0,
            steps: 0,
            deferred: None,
            error: None,
        }
    }
}

/// Run every selected collector once (concurrently) and then step every
/// selected harvester once, in order.
pub async fn run_once(
    store: &Arc<dyn Store>,
    pipeline: &Pipeline,
    collectors: &[NodeId],
    harvesters: &[NodeId],
    options: &RunOptions,
) -> Result<Vec<ComponentReport>> {
    let mut reports = Vec::new();

    let mut tasks = JoinSet::new();
    for &id in collectors {
        let spec = pipeline.spec(id).clone();
        let collector = pipeline
            .collector(id)
            .with_context(|| format!("'{}' is not a collector", spec.name))?;
        let store = Arc::clone(store);
        tasks.spawn(async move {
            let result = collect_once(store.as_ref(), &spec, collector.as_ref()).await;
            (spec, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (spec, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!("collector task panicked: {}", e);
                continue;
            }
        };
        let mut report = ComponentReport::new(&spec.name, "collector");
        match result {
            Ok(_) => report.written = 1,
            Err(e) if spec.fail_fast.unwrap_or(options.fail_fast) => return Err(e),
            Err(e) => {
                warn!(collector = %spec.name, "{:#}", e);
                report.error = Some(format!("{:#}", e));
            }
        }
        reports.push(report);
    }
    reports.sort_by(|a, b| a.name.cmp(&b.name));

    for &id in harvesters {
        let spec = pipeline.spec(id);
        let plan = plan_of(spec)?;
        let harvester = pipeline
            .harvester(id)
            .with_context(|| format!("'{}' is not a harvester", spec.name))?;
        let mut report = ComponentReport::new(&spec.name, "harvester");
        step_into(store.as_ref(), &plan, harvester.as_ref(), &mut report).await;
        reports.push(report);
    }
    Ok(reports)
}

/// Record one step in `report`. Returns true when it made progress.
async fn step_into(
    store: &dyn Store,
    plan: &HarvestPlan,
    harvester: &dyn Harvester,
    report: &mut ComponentReport,
) -> bool {
    match harvest_step(store, plan, harvester).await {
        Ok(StepOutcome::Progress { written, .. }) => {
            report.written += written;
            report.steps += 1;
            true
        }
        Ok(StepOutcome::Deferred(reason)) => {
            report.deferred = Some(reason.to_string());
            false
        }
        Err(e) => {
            warn!(harvester = %plan.name, "{}", e);
            report.error = Some(e.to_string());
            false
        }
    }
}

/// Bring the selected harvesters up to date, in bootstrap order.
///
/// Harvesters caught in a dependency cycle still run, after the others;
/// they are logged so the configuration can be fixed.
pub async fn catch_up(
    store: &Arc<dyn Store>,
    pipeline: &Pipeline,
    harvesters: &[NodeId],
) -> Result<Vec<ComponentReport>> {
    let order = pipeline.graph().bootstrap_order();
    for id in &order.unresolved {
        warn!(harvester = %pipeline.spec(*id).name, "dependency order unresolved (cycle?)");
    }

    let mut reports = Vec::new();
    for id in order.order.into_iter().filter(|id| harvesters.contains(id)) {
        let spec = pipeline.spec(id);
        let plan = plan_of(spec)?;
        let harvester = pipeline
            .harvester(id)
            .with_context(|| format!("'{}' is not a harvester", spec.name))?;
        let mut report = ComponentReport::new(&spec.name, "harvester");
        for _ in 0..MAX_CATCH_UP_STEPS {
            if !step_into(store.as_ref(), &plan, harvester.as_ref(), &mut report).await {
                break;
            }
        }
        info!(harvester = %spec.name, steps = report.steps, written = report.written, "caught up");
        reports.push(report);
    }
    Ok(reports)
}
