//! Range handler: raw items of one collection between two timestamps.
//!
//! ```toml
//! [handlers.recent_positions]
//! implementation = "range"
//! collection = "positions"
//! query_parameters = { start = "int?", end = "int?", limit = "int?" }
//! ```
//!
//! Both bounds are inclusive. Answers `[{"timestamp", "data"}, ...]`,
//! oldest first, with binary data base64 encoded. A collection with no
//! rows at all answers 404.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use mobility_harvester_core::component::{Handler, HandlerContext, ParamError, Params};
use mobility_harvester_core::models::Payload;
use mobility_harvester_core::store::ItemQuery;

use crate::config::ComponentSpec;
use crate::harvester_concat::payload_to_json;

pub struct RangeHandler {
    collection: String,
}

impl RangeHandler {
    pub fn new(collection: String) -> Self {
        Self { collection }
    }

    pub fn from_spec(spec: &ComponentSpec) -> Result<Self> {
        let collection = spec
            .setting_reference("collection")
            .context("the range handler needs a 'collection' setting")?;
        Ok(Self::new(collection))
    }
}

/// Item query for optional inclusive `start`/`end` bounds and a `limit`.
///
/// A `limit` outside `0..=u32::MAX` is a client error.
pub fn bounded_query(
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<i64>,
) -> Result<ItemQuery, ParamError> {
    let mut query = ItemQuery::all();
    if let Some(start) = start {
        query = query.since(start);
    }
    if let Some(end) = end {
        query = query.until(end);
    }
    if let Some(limit) = limit {
        let limit = u32::try_from(limit).map_err(|_| ParamError::OutOfRange {
            name: "limit".to_string(),
            allowed: format!("between 0 and {}", u32::MAX),
            value: limit.to_string(),
        })?;
        query = query.limit(limit);
    }
    Ok(query)
}

#[async_trait]
impl Handler for RangeHandler {
    async fn run(&self, params: &Params, ctx: &HandlerContext) -> Result<Option<Payload>> {
        if ctx.latest(&self.collection).await?.is_none() {
            return Ok(None);
        }
        let query = bounded_query(params.int("start"), params.int("end"), params.int("limit"))?;
        let items = ctx.query(&self.collection, &query).await?;

        let rows = items
            .iter()
            .map(|item| {
                Ok(json!({
                    "timestamp": item.timestamp,
                    "data": payload_to_json(item.payload()?.as_ref()),
                }))
            })
            .collect::<Result<Vec<Value>>>()?;
        Ok(Some(Payload::Json(Value::Array(rows))))
    }
}
