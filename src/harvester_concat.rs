//! Concat harvester: packs a window into one JSON array.
//!
//! Meant for duration windows, e.g. an hourly archive of a collector:
//!
//! ```toml
//! [harvesters.positions_hourly]
//! implementation = "concat"
//! source = "positions"
//! source_range = "1h"
//! ```
//!
//! Output: `[{"timestamp": 1700000000, "data": ...}, ...]`. JSON payloads
//! are embedded as-is, text as a string, binary as base64, and empty rows
//! as `null`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use mobility_harvester_core::component::{HarvestInput, HarvestOutput, Harvester};
use mobility_harvester_core::models::{Payload, PayloadKind};

use crate::config::ComponentSpec;

pub struct ConcatHarvester;

impl ConcatHarvester {
    pub fn from_spec(spec: &ComponentSpec) -> Result<Self> {
        if spec.kind != PayloadKind::Json {
            bail!("the concat harvester produces json, not {}", spec.kind);
        }
        Ok(Self)
    }
}

/// JSON rendering of a stored payload, shared with the range handler.
pub fn payload_to_json(payload: Option<&Payload>) -> Value {
    match payload {
        None => Value::Null,
        Some(Payload::Json(value)) => value.clone(),
        Some(Payload::Text(text)) => Value::String(text.clone()),
        Some(Payload::Binary(bytes)) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

#[async_trait]
impl Harvester for ConcatHarvester {
    async fn run(&self, input: HarvestInput) -> Result<HarvestOutput> {
        if input.source.is_empty() {
            return Ok(HarvestOutput::Nothing);
        }
        let rows: Vec<Value> = input
            .source
            .iter()
            .map(|record| {
                json!({
                    "timestamp": record.timestamp,
                    "data": payload_to_json(record.payload.as_ref()),
                })
            })
            .collect();
        Ok(HarvestOutput::One(Payload::Json(Value::Array(rows))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobility_harvester_core::models::Record;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_concat_keeps_order_and_encodes_payloads() {
        let input = HarvestInput {
            reference_timestamp: 3_600,
            source: vec![
                Record {
                    timestamp: 10,
                    payload: Some(Payload::Json(json!({"n": 1}))),
                },
                Record {
                    timestamp: 20,
                    payload: None,
                },
                Record {
                    timestamp: 30,
                    payload: Some(Payload::Binary(vec![0xde, 0xad])),
                },
            ],
            dependencies: BTreeMap::new(),
        };
        let out = ConcatHarvester.run(input).await.unwrap();
        let HarvestOutput::One(Payload::Json(value)) = out else {
            panic!("expected one json payload");
        };
        assert_eq!(
            value,
            json!([
                {"timestamp": 10, "data": {"n": 1}},
                {"timestamp": 20, "data": null},
                {"timestamp": 30, "data": "3q0="}
            ])
        );
    }
}
