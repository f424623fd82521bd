//! Trips handler: trajectory output regrouped by trip.
//!
//! ```toml
//! [handlers.trips]
//! implementation = "trips"
//! collection = "vehicle_trips"
//! query_parameters = { start_timestamp = "int?", end_timestamp = "int?" }
//! ```
//!
//! Reads the `reports` of every trajectory output between the optional
//! bounds and answers one entry per trip id, ordered by first timestamp:
//!
//! ```json
//! [{"trip_id": "…", "line": "46", "direction": "A",
//!   "start": 1700000000, "end": 1700000600,
//!   "timestamps": [...], "distances": [...]}]
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use mobility_harvester_core::component::{Handler, HandlerContext, Params};
use mobility_harvester_core::models::Payload;
use mobility_harvester_core::trajectory::PositionReport;

use crate::config::ComponentSpec;
use crate::handler_range::bounded_query;

pub struct TripsHandler {
    collection: String,
}

#[derive(Debug, Serialize)]
struct TripSummary {
    trip_id: String,
    line: String,
    direction: String,
    start: i64,
    end: i64,
    timestamps: Vec<i64>,
    distances: Vec<f64>,
}

impl TripsHandler {
    pub fn new(collection: String) -> Self {
        Self { collection }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self> {
        let collection = spec
            .setting_reference("collection")
            .context("the trips handler needs a 'collection' setting")?;
        Ok(Self::new(collection))
    }
}

#[async_trait]
impl Handler for TripsHandler {
    async fn run(&self, params: &Params, ctx: &HandlerContext) -> Result<Option<Payload>> {
        let query = bounded_query(
            params.int("start_timestamp"),
            params.int("end_timestamp"),
            None,
        )?;
        let items = ctx.query(&self.collection, &query).await?;
        if items.is_empty() {
            return Ok(None);
        }

        let mut trips: Vec<TripSummary> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in &items {
            let Some(payload) = item.payload()? else {
                continue;
            };
            let Some(Value::Array(reports)) = payload.as_json().and_then(|v| v.get("reports"))
            else {
                continue;
            };
            for report in reports {
                let report: PositionReport = serde_json::from_value(report.clone())
                    .with_context(|| format!("malformed report in row {}", item.timestamp))?;
                let Some(trip_id) = report.trip_id.clone() else {
                    continue;
                };
                let slot = *index.entry(trip_id.clone()).or_insert_with(|| {
                    trips.push(TripSummary {
                        trip_id,
                        line: report.line.clone(),
                        direction: report.direction.clone(),
                        start: report.timestamp,
                        end: report.timestamp,
                        timestamps: Vec::new(),
                        distances: Vec::new(),
                    });
                    trips.len() - 1
                });
                let trip = &mut trips[slot];
                trip.start = trip.start.min(report.timestamp);
                trip.end = trip.end.max(report.timestamp);
                trip.timestamps.push(report.timestamp);
                trip.distances.push(report.distance);
            }
        }

        trips.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.trip_id.cmp(&b.trip_id)));
        Ok(Some(Payload::Json(serde_json::to_value(trips)?)))
    }
}
