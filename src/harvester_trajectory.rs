//! Trajectory harvester: tags anonymous position reports with trip ids.
//!
//! Each source row holds one poll of a feed: a JSON array of position
//! reports, or an object with a `reports` array. Reports are grouped by
//! `(line, direction)`, every group is reconstructed on the rayon pool
//! (off the async runtime), and the open trips of the previous output are
//! carried into the next window.
//!
//! # Configuration
//!
//! ```toml
//! [harvesters.trips]
//! implementation = "trajectory"
//! source = "positions"
//! source_range = 6
//! dependencies = ["trips"]
//! dependencies_limit = [10]
//! # state = "trips"           # defaults to the harvester itself
//! # profile = { tram_lines = ["3", "7"], bus_ceiling = 70.0 }
//! ```
//!
//! Output payload:
//!
//! ```json
//! {"reports": [...], "open_trips": [{"id", "line", "direction", "points"}], "trip_count": 4}
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rayon::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use mobility_harvester_core::component::{HarvestInput, HarvestOutput, Harvester};
use mobility_harvester_core::models::{Payload, PayloadKind, Record};
use mobility_harvester_core::trajectory::{
    reconstruct, OpenTrip, PositionReport, SpeedProfile, TripBatch, MAX_IDLE_GAP_SECS,
};

use crate::config::ComponentSpec;

pub struct TrajectoryHarvester {
    name: String,
    /// Full name of the dependency holding the previous open trips.
    state: String,
    profile: SpeedProfile,
}

impl TrajectoryHarvester {
    pub fn new(name: &str, state: &str, profile: SpeedProfile) -> Self {
        Self {
            name: name.to_string(),
            state: state.to_string(),
            profile,
        }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self> {
        if spec.kind != PayloadKind::Json {
            bail!("the trajectory harvester produces json, not {}", spec.kind);
        }
        if spec.multiple_results {
            bail!("the trajectory harvester produces one output per window");
        }

        let state = spec
            .setting_reference("state")
            .unwrap_or_else(|| spec.name.clone());
        let declared = spec
            .dependencies
            .iter()
            .find(|d| d.name == state)
            .with_context(|| format!("state '{}' must be listed in dependencies", state))?;
        // A limit of 1 is a mandatory snapshot, which the first window
        // can never satisfy from its own output.
        if state == spec.name && declared.limit < 2 {
            bail!("its own state needs dependencies_limit >= 2 so the first window can start empty");
        }

        let profile = match spec.settings.get("profile") {
            Some(value) => value
                .clone()
                .try_into::<SpeedProfile>()
                .context("invalid trajectory profile")?,
            None => SpeedProfile::default(),
        };

        Ok(Self::new(&spec.name, &state, profile))
    }
}

/// Reports of one source row, plus the number of entries that could not
/// be read as a report. A report without a timestamp takes the row's.
///
/// An empty row holds no reports. Any other payload must be a JSON array or
/// an object with a `reports` array; anything else fails the step, so a
/// feed format change never advances the window over unread data.
fn reports_in(record: &Record) -> Result<(Vec<PositionReport>, usize)> {
    let Some(payload) = &record.payload else {
        return Ok((Vec::new(), 0));
    };
    let Some(value) = payload.as_json() else {
        bail!(
            "source row {} holds {} data, expected json position reports",
            record.timestamp,
            payload.kind()
        );
    };
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("reports") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => bail!("source row {} has no 'reports' array", record.timestamp),
        },
        other => bail!(
            "source row {} is not a list of position reports: {}",
            record.timestamp,
            other
        ),
    };

    let mut reports = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        let mut item = item.clone();
        if let Value::Object(map) = &mut item {
            map.entry("timestamp").or_insert(json!(record.timestamp));
        }
        match serde_json::from_value::<PositionReport>(item) {
            Ok(report) => reports.push(report),
            Err(e) => {
                skipped += 1;
                warn!(timestamp = record.timestamp, "skipping position report: {}", e);
            }
        }
    }
    Ok((reports, skipped))
}

/// Open trips stored in the latest state row.
fn carried_trips(input: &HarvestInput, state: &str) -> Result<Vec<OpenTrip>> {
    let Some(record) = input.dependencies.get(state).and_then(|rows| rows.latest()) else {
        return Ok(Vec::new());
    };
    match record.json().and_then(|v| v.get("open_trips")) {
        Some(trips) => Ok(serde_json::from_value(trips.clone())
            .with_context(|| format!("malformed open_trips in state row {}", record.timestamp))?),
        None => Ok(Vec::new()),
    }
}

fn output(
    reports: &[PositionReport],
    open_trips: &[OpenTrip],
    skipped: usize,
) -> Result<HarvestOutput> {
    let trip_count = reports
        .iter()
        .filter_map(|r| r.trip_id.as_deref())
        .collect::<BTreeSet<_>>()
        .len();
    Ok(HarvestOutput::One(Payload::Json(json!({
        "reports": reports,
        "open_trips": open_trips,
        "trip_count": trip_count,
        "skipped_reports": skipped,
    }))))
}

#[async_trait]
impl Harvester for TrajectoryHarvester {
    async fn run(&self, input: HarvestInput) -> Result<HarvestOutput> {
        let carried = carried_trips(&input, &self.state)?;
        let mut fresh = Vec::new();
        let mut skipped = 0;
        for record in &input.source {
            let (reports, bad) = reports_in(record)?;
            fresh.extend(reports);
            skipped += bad;
        }

        if fresh.is_empty() {
            return output(&[], &carried, skipped);
        }

        let newest = fresh.iter().map(|r| r.timestamp).max().unwrap_or(i64::MIN);
        let horizon = newest.saturating_sub(MAX_IDLE_GAP_SECS as i64);

        let mut batches: BTreeMap<(String, String), TripBatch> = BTreeMap::new();
        for report in fresh {
            let key = (report.line.clone(), report.direction.clone());
            batches
                .entry(key)
                .or_insert_with(|| TripBatch {
                    line: report.line.clone(),
                    direction: report.direction.clone(),
                    ..TripBatch::default()
                })
                .fresh
                .push(report);
        }

        // Trips silent for longer than a trip may bridge cannot continue.
        // Recent trips of a line absent from this window stay open as-is.
        let mut idle = Vec::new();
        for trip in carried {
            let recent = trip
                .points
                .last()
                .is_some_and(|p| p.timestamp >= horizon);
            if !recent {
                continue;
            }
            match batches.get_mut(&(trip.line.clone(), trip.direction.clone())) {
                Some(batch) => batch.carried.extend(trip.points),
                None => idle.push(trip),
            }
        }

        let profile = self.profile.clone();
        let batches: Vec<TripBatch> = batches.into_values().collect();
        let results = tokio::task::spawn_blocking(move || {
            batches
                .into_par_iter()
                .map(|batch| reconstruct(batch, &profile))
                .collect::<Vec<_>>()
        })
        .await
        .with_context(|| format!("{}: reconstruction task failed", self.name))?;

        let mut reports = Vec::new();
        let mut open_trips = idle;
        for result in &results {
            reports.extend(result.labeled_reports());
            open_trips.extend(result.open_trips());
        }
        reports.sort_by_key(|r| r.timestamp);

        if reports.is_empty() {
            warn!(harvester = %self.name, "window produced no labeled reports");
        }
        if skipped > 0 {
            warn!(harvester = %self.name, skipped, "window skipped unreadable position reports");
        }
        output(&reports, &open_trips, skipped)
    }
}
