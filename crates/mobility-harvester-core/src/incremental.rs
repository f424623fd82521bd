//! One step of a harvester's incremental fold over its source.
//!
//! A step reads the harvester's own latest output timestamp `T_last`,
//! picks the next window of source rows after it, gathers dependency rows
//! as of the window's reference timestamp, runs the transform and stores
//! the result. When the window cannot be filled the step is *deferred*:
//! nothing is written and the caller retries later.
//!
//! ```text
//!   source:  ──●──●──●──┊──●──●──────────●──▶ t
//!                 T_last┘  └─ window ─┘
//!   own:     ──────────■
//! ```
//!
//! Writing `None` is still progress: it moves `T_last` forward, which is
//! what makes re-running a harvester with no new input a no-op.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::component::{DependencyRows, HarvestInput, HarvestOutput, Harvester};
use crate::models::{Payload, PayloadError, PayloadKind, Record, StoredItem};
use crate::range::{round_down, SourceRange};
use crate::store::{ItemQuery, Store, StoreError};

/// A dependency and how many of its most recent rows to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPlan {
    pub name: String,
    /// `1` means a mandatory snapshot.
    pub limit: u32,
}

/// Everything a step needs to know about one harvester.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestPlan {
    pub name: String,
    pub kind: PayloadKind,
    pub source: String,
    pub source_range: SourceRange,
    pub strict: bool,
    pub dependencies: Vec<DependencyPlan>,
    pub multiple_results: bool,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("'{harvester}' needs a row of '{dependency}' at or before {timestamp}, found none")]
    MissingDependency {
        harvester: String,
        dependency: String,
        timestamp: i64,
    },
    #[error("'{harvester}' transform failed: {source}")]
    Transform {
        harvester: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("'{harvester}' returned output of the wrong shape: {reason}")]
    OutputMismatch { harvester: String, reason: String },
}

/// Why a step did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// No source rows after `T_last`.
    EmptyWindow,
    /// Strict count window with too few rows.
    IncompleteWindow { have: usize, want: u64 },
    /// Strict duration window whose period has not ended yet.
    PeriodOpen { end: i64 },
    /// An output already exists at or after the window end.
    AlreadyHarvested { end: i64 },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::EmptyWindow => f.write_str("no new source rows"),
            DeferReason::IncompleteWindow { have, want } => {
                write!(f, "window incomplete ({have}/{want} rows)")
            }
            DeferReason::PeriodOpen { end } => write!(f, "period ending at {end} still open"),
            DeferReason::AlreadyHarvested { end } => {
                write!(f, "period ending at {end} already harvested")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Progress { written: usize, reference: i64 },
    Deferred(DeferReason),
}

impl StepOutcome {
    pub fn made_progress(&self) -> bool {
        matches!(self, StepOutcome::Progress { .. })
    }
}

/// The rows selected for one step.
struct Window {
    rows: Vec<StoredItem>,
    reference: i64,
}

/// Run one incremental step of `harvester` as described by `plan`.
pub async fn harvest_step(
    store: &dyn Store,
    plan: &HarvestPlan,
    harvester: &dyn Harvester,
) -> Result<StepOutcome, HarvestError> {
    let last_output = store.latest(&plan.name).await?.map(|item| item.timestamp);
    let t_last = match last_output {
        Some(ts) => ts,
        None => match store.earliest(&plan.source).await? {
            Some(first) => first.timestamp - 1,
            None => return Ok(StepOutcome::Deferred(DeferReason::EmptyWindow)),
        },
    };

    let window = match plan.source_range {
        SourceRange::Count(n) => count_window(store, plan, t_last, n).await?,
        SourceRange::Duration(period) => {
            duration_window(store, plan, t_last, last_output, period).await?
        }
    };
    let window = match window {
        Ok(window) => window,
        Err(reason) => return Ok(StepOutcome::Deferred(reason)),
    };

    let dependencies = fetch_dependencies(store, plan, window.reference).await?;
    let timestamps: Vec<i64> = window.rows.iter().map(|row| row.timestamp).collect();
    let source = window
        .rows
        .into_iter()
        .map(StoredItem::into_record)
        .collect::<Result<Vec<Record>, _>>()?;

    let output = harvester
        .run(HarvestInput {
            reference_timestamp: window.reference,
            source,
            dependencies,
        })
        .await
        .map_err(|source| HarvestError::Transform {
            harvester: plan.name.clone(),
            source,
        })?;

    let writes = plan_writes(plan, output, window.reference, &timestamps)?;
    for (_, payload) in &writes {
        if let Some(payload) = payload {
            payload.expect_kind(plan.kind)?;
        }
    }
    for (timestamp, payload) in &writes {
        store
            .store_payload(&plan.name, *timestamp, plan.kind, payload.as_ref())
            .await?;
    }

    Ok(StepOutcome::Progress {
        written: writes.len(),
        reference: window.reference,
    })
}

async fn count_window(
    store: &dyn Store,
    plan: &HarvestPlan,
    t_last: i64,
    n: u64,
) -> Result<Result<Window, DeferReason>, StoreError> {
    let limit = u32::try_from(n).unwrap_or(u32::MAX);
    let rows = store
        .query(&plan.source, &ItemQuery::all().after(t_last).limit(limit))
        .await?;
    let Some(last) = rows.last() else {
        return Ok(Err(DeferReason::EmptyWindow));
    };
    if plan.strict && (rows.len() as u64) < n {
        return Ok(Err(DeferReason::IncompleteWindow {
            have: rows.len(),
            want: n,
        }));
    }
    let reference = last.timestamp;
    Ok(Ok(Window { rows, reference }))
}

/// Duration windows are epoch-aligned periods. The period is the one
/// containing the first unconsumed source row, so empty periods between
/// bursts of data are skipped.
async fn duration_window(
    store: &dyn Store,
    plan: &HarvestPlan,
    t_last: i64,
    last_output: Option<i64>,
    period: i64,
) -> Result<Result<Window, DeferReason>, StoreError> {
    // A single output sits on the period end, which is also the first
    // instant of the next period. Per-row outputs sit on consumed rows.
    let unconsumed = if plan.multiple_results {
        ItemQuery::all().after(t_last)
    } else {
        ItemQuery::all().since(t_last)
    };

    let next = store
        .query(&plan.source, &unconsumed.clone().limit(1).skip_data())
        .await?;
    let Some(next) = next.first() else {
        return Ok(Err(DeferReason::EmptyWindow));
    };
    let start = round_down(next.timestamp, period);
    let end = start + period;

    if last_output.is_some_and(|ts| ts >= end) {
        return Ok(Err(DeferReason::AlreadyHarvested { end }));
    }
    if plan.strict {
        let closing = store
            .query(&plan.source, &ItemQuery::all().since(end).limit(1).skip_data())
            .await?;
        if closing.is_empty() {
            return Ok(Err(DeferReason::PeriodOpen { end }));
        }
    }

    let rows = store.query(&plan.source, &unconsumed.before(end)).await?;
    if rows.is_empty() {
        return Ok(Err(DeferReason::EmptyWindow));
    }
    Ok(Ok(Window {
        rows,
        reference: end,
    }))
}

async fn fetch_dependencies(
    store: &dyn Store,
    plan: &HarvestPlan,
    reference: i64,
) -> Result<BTreeMap<String, DependencyRows>, HarvestError> {
    let mut out = BTreeMap::new();
    for dep in &plan.dependencies {
        let query = ItemQuery::all().until(reference).descending().limit(dep.limit);
        let mut rows = store
            .query(&dep.name, &query)
            .await?
            .into_iter()
            .map(StoredItem::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();

        let value = if dep.limit == 1 {
            let snapshot = rows.pop().ok_or_else(|| HarvestError::MissingDependency {
                harvester: plan.name.clone(),
                dependency: dep.name.clone(),
                timestamp: reference,
            })?;
            DependencyRows::Snapshot(snapshot)
        } else {
            DependencyRows::History(rows)
        };
        out.insert(dep.name.clone(), value);
    }
    Ok(out)
}

/// Pair every output with the timestamp it is stored at.
fn plan_writes(
    plan: &HarvestPlan,
    output: HarvestOutput,
    reference: i64,
    timestamps: &[i64],
) -> Result<Vec<(i64, Option<Payload>)>, HarvestError> {
    let mismatch = |reason: String| HarvestError::OutputMismatch {
        harvester: plan.name.clone(),
        reason,
    };
    match (plan.multiple_results, output) {
        (false, HarvestOutput::Nothing) => Ok(vec![(reference, None)]),
        (false, HarvestOutput::One(payload)) => Ok(vec![(reference, Some(payload))]),
        (false, HarvestOutput::Many(_)) => Err(mismatch(
            "a list of results requires multiple_results = true".into(),
        )),
        (true, HarvestOutput::Nothing) => Ok(timestamps.iter().map(|ts| (*ts, None)).collect()),
        (true, HarvestOutput::One(_)) => Err(mismatch(
            "multiple_results harvesters must return one result per source row".into(),
        )),
        (true, HarvestOutput::Many(payloads)) => {
            if payloads.len() != timestamps.len() {
                return Err(mismatch(format!(
                    "{} results for {} source rows",
                    payloads.len(),
                    timestamps.len()
                )));
            }
            Ok(timestamps.iter().copied().zip(payloads).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Sums the `v` field of every source row and records what it saw.
    #[derive(Default)]
    struct Summer {
        seen: Mutex<Vec<HarvestInput>>,
    }

    #[async_trait]
    impl Harvester for Summer {
        async fn run(&self, input: HarvestInput) -> anyhow::Result<HarvestOutput> {
            let total: i64 = input
                .source
                .iter()
                .filter_map(|r| r.json().and_then(|v| v["v"].as_i64()))
                .sum();
            self.seen.lock().unwrap().push(input);
            Ok(HarvestOutput::One(Payload::Json(json!({ "total": total }))))
        }
    }

    /// Echoes every source row, or nothing at all.
    struct PerRow {
        silent: bool,
    }

    #[async_trait]
    impl Harvester for PerRow {
        async fn run(&self, input: HarvestInput) -> anyhow::Result<HarvestOutput> {
            if self.silent {
                return Ok(HarvestOutput::Nothing);
            }
            Ok(HarvestOutput::Many(
                input.source.into_iter().map(|r| r.payload).collect(),
            ))
        }
    }

    struct Failing;

    #[async_trait]
    impl Harvester for Failing {
        async fn run(&self, _input: HarvestInput) -> anyhow::Result<HarvestOutput> {
            anyhow::bail!("boom")
        }
    }

    fn plan(range: SourceRange, strict: bool) -> HarvestPlan {
        HarvestPlan {
            name: "out".into(),
            kind: PayloadKind::Json,
            source: "feed".into(),
            source_range: range,
            strict,
            dependencies: vec![],
            multiple_results: false,
        }
    }

    async fn feed(store: &InMemoryStore, rows: &[i64]) {
        for ts in rows {
            store
                .store_payload("feed", *ts, PayloadKind::Json, Some(&Payload::Json(json!({"v": ts}))))
                .await
                .unwrap();
        }
    }

    async fn outputs(store: &InMemoryStore) -> Vec<(i64, Option<serde_json::Value>)> {
        store
            .query("out", &ItemQuery::all())
            .await
            .unwrap()
            .into_iter()
            .map(|item| {
                let json = item.payload().unwrap().and_then(|p| p.as_json().cloned());
                (item.timestamp, json)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_strict_count_window_never_runs_short() {
        let store = InMemoryStore::new();
        feed(&store, &[10, 20, 30, 40, 50]).await;
        let plan = plan(SourceRange::Count(3), true);
        let summer = Summer::default();

        let first = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            first,
            StepOutcome::Progress {
                written: 1,
                reference: 30
            }
        );

        let second = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            second,
            StepOutcome::Deferred(DeferReason::IncompleteWindow { have: 2, want: 3 })
        );
        assert_eq!(store.latest("out").await.unwrap().unwrap().timestamp, 30);

        feed(&store, &[60]).await;
        harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            outputs(&store).await,
            vec![
                (30, Some(json!({"total": 60}))),
                (60, Some(json!({"total": 150}))),
            ]
        );
        for input in summer.seen.lock().unwrap().iter() {
            assert_eq!(input.source.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_rerun_without_new_rows_is_a_noop() {
        let store = InMemoryStore::new();
        feed(&store, &[10, 20]).await;
        let plan = plan(SourceRange::default(), true);
        let summer = Summer::default();

        assert!(harvest_step(&store, &plan, &summer).await.unwrap().made_progress());
        assert!(harvest_step(&store, &plan, &summer).await.unwrap().made_progress());
        let again = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(again, StepOutcome::Deferred(DeferReason::EmptyWindow));
        assert_eq!(store.latest("out").await.unwrap().unwrap().timestamp, 20);
        assert_eq!(summer.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_source_defers() {
        let store = InMemoryStore::new();
        let outcome = harvest_step(&store, &plan(SourceRange::Count(1), true), &Summer::default())
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Deferred(DeferReason::EmptyWindow));
    }

    #[tokio::test]
    async fn test_lenient_count_window_takes_what_is_there() {
        let store = InMemoryStore::new();
        feed(&store, &[10, 20]).await;
        let outcome = harvest_step(&store, &plan(SourceRange::Count(5), false), &Summer::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Progress {
                written: 1,
                reference: 20
            }
        );
    }

    #[tokio::test]
    async fn test_duration_windows_skip_gaps_and_wait_for_period_end() {
        let store = InMemoryStore::new();
        feed(&store, &[100, 110, 130, 400]).await;
        let plan = plan(SourceRange::Duration(60), true);
        let summer = Summer::default();

        let first = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            first,
            StepOutcome::Progress {
                written: 1,
                reference: 120
            }
        );
        let second = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            second,
            StepOutcome::Progress {
                written: 1,
                reference: 180
            }
        );
        let third = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            third,
            StepOutcome::Deferred(DeferReason::PeriodOpen { end: 420 })
        );

        feed(&store, &[425]).await;
        let fourth = harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            fourth,
            StepOutcome::Progress {
                written: 1,
                reference: 420
            }
        );
        assert_eq!(
            outputs(&store).await,
            vec![
                (120, Some(json!({"total": 210}))),
                (180, Some(json!({"total": 130}))),
                (420, Some(json!({"total": 400}))),
            ]
        );
    }

    #[tokio::test]
    async fn test_row_on_period_boundary_belongs_to_next_period() {
        let store = InMemoryStore::new();
        feed(&store, &[60, 120, 150, 200]).await;
        let plan = plan(SourceRange::Duration(60), true);
        let summer = Summer::default();

        harvest_step(&store, &plan, &summer).await.unwrap();
        harvest_step(&store, &plan, &summer).await.unwrap();
        assert_eq!(
            outputs(&store).await,
            vec![
                (120, Some(json!({"total": 60}))),
                (180, Some(json!({"total": 270}))),
            ]
        );
    }

    #[tokio::test]
    async fn test_multiple_results_are_keyed_by_row() {
        let store = InMemoryStore::new();
        feed(&store, &[10, 20, 30]).await;
        let mut plan = plan(SourceRange::Count(2), false);
        plan.multiple_results = true;

        harvest_step(&store, &plan, &PerRow { silent: false })
            .await
            .unwrap();
        let outcome = harvest_step(&store, &plan, &PerRow { silent: true })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Progress {
                written: 1,
                reference: 30
            }
        );
        assert_eq!(
            outputs(&store).await,
            vec![
                (10, Some(json!({"v": 10}))),
                (20, Some(json!({"v": 20}))),
                (30, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_multiple_results_with_duration_window() {
        let store = InMemoryStore::new();
        feed(&store, &[10, 20, 70, 130]).await;
        let mut plan = plan(SourceRange::Duration(60), true);
        plan.multiple_results = true;
        let harvester = PerRow { silent: false };

        harvest_step(&store, &plan, &harvester).await.unwrap();
        harvest_step(&store, &plan, &harvester).await.unwrap();
        let third = harvest_step(&store, &plan, &harvester).await.unwrap();
        assert_eq!(third, StepOutcome::Deferred(DeferReason::PeriodOpen { end: 180 }));
        let stamps: Vec<i64> = outputs(&store).await.into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(stamps, vec![10, 20, 70]);
    }

    #[tokio::test]
    async fn test_dependencies_snapshot_and_history() {
        let store = InMemoryStore::new();
        feed(&store, &[50]).await;
        for ts in [10, 20, 30, 60] {
            store
                .store_payload("stops", ts, PayloadKind::Json, Some(&Payload::Json(json!(ts))))
                .await
                .unwrap();
        }
        let mut plan = plan(SourceRange::Count(1), true);
        plan.dependencies = vec![
            DependencyPlan {
                name: "stops".into(),
                limit: 1,
            },
            DependencyPlan {
                name: "stops_history".into(),
                limit: 3,
            },
        ];
        for ts in [10, 20, 30] {
            store
                .store_payload("stops_history", ts, PayloadKind::Json, Some(&Payload::Json(json!(ts))))
                .await
                .unwrap();
        }

        let summer = Summer::default();
        harvest_step(&store, &plan, &summer).await.unwrap();
        let seen = summer.seen.lock().unwrap();
        let input = &seen[0];
        assert_eq!(input.reference_timestamp, 50);
        assert_eq!(input.dependencies["stops"].latest().unwrap().timestamp, 30);
        let history: Vec<i64> = input.dependencies["stops_history"]
            .records()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(history, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_dependency_fails_the_step() {
        let store = InMemoryStore::new();
        feed(&store, &[50]).await;
        let mut plan = plan(SourceRange::Count(1), true);
        plan.dependencies = vec![DependencyPlan {
            name: "stops".into(),
            limit: 1,
        }];

        let err = harvest_step(&store, &plan, &Summer::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::MissingDependency { timestamp: 50, .. }));
        assert!(store.latest("out").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transform_error_writes_nothing() {
        let store = InMemoryStore::new();
        feed(&store, &[10]).await;
        let err = harvest_step(&store, &plan(SourceRange::Count(1), true), &Failing)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Transform { .. }));
        assert!(store.latest("out").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_output_without_multiple_results_is_rejected() {
        let store = InMemoryStore::new();
        feed(&store, &[10]).await;
        let err = harvest_step(
            &store,
            &plan(SourceRange::Count(1), true),
            &PerRow { silent: false },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::OutputMismatch { .. }));
    }

    #[tokio::test]
    async fn test_wrong_payload_kind_is_rejected_before_writing() {
        struct Texty;

        #[async_trait]
        impl Harvester for Texty {
            async fn run(&self, _input: HarvestInput) -> anyhow::Result<HarvestOutput> {
                Ok(HarvestOutput::One(Payload::Text("nope".into())))
            }
        }

        let store = InMemoryStore::new();
        feed(&store, &[10]).await;
        let err = harvest_step(&store, &plan(SourceRange::Count(1), true), &Texty)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Payload(PayloadError::KindMismatch { .. })));
        assert!(store.latest("out").await.unwrap().is_none());
    }
}
