//! The three component roles and their invocation contracts.
//!
//! ```text
//!  Collector ──run()──────────────────────────▶ Payload
//!  Harvester ──run(HarvestInput)──────────────▶ HarvestOutput
//!  Handler   ──run(Params, &HandlerContext)───▶ Option<Payload>
//! ```
//!
//! Implementations are built once at startup by the application's
//! registry and held as `Arc<dyn …>` inside [`Component`]. They never see
//! each other: collectors and harvesters exchange data only through the
//! store, and handlers get a read-only view of it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::{Payload, Record, StoredItem};
use crate::store::{ItemQuery, Store, StoreError};

/// Which contract a configured component fulfils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Collector,
    Harvester,
    Handler,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Collector => "collector",
            Role::Harvester => "harvester",
            Role::Handler => "handler",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Collector
// ═══════════════════════════════════════════════════════════════════════

/// Fetches one payload per invocation. No inputs, no partial results.
///
/// The runner checks the returned payload against the collection's
/// declared kind and stores it at the current Unix second.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn run(&self) -> anyhow::Result<Payload>;
}

// ═══════════════════════════════════════════════════════════════════════
// Harvester
// ═══════════════════════════════════════════════════════════════════════

/// Rows of one dependency as of the reference timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyRows {
    /// `dependencies_limit == 1`: the latest row, always present.
    Snapshot(Record),
    /// Up to `limit` rows in chronological order, possibly empty.
    History(Vec<Record>),
}

impl DependencyRows {
    /// Most recent row, if any.
    pub fn latest(&self) -> Option<&Record> {
        match self {
            DependencyRows::Snapshot(record) => Some(record),
            DependencyRows::History(rows) => rows.last(),
        }
    }

    pub fn records(&self) -> &[Record] {
        match self {
            DependencyRows::Snapshot(record) => std::slice::from_ref(record),
            DependencyRows::History(rows) => rows,
        }
    }
}

/// Everything one harvester step hands to its transform.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestInput {
    /// Timestamp the single output is stored at.
    pub reference_timestamp: i64,
    /// Source rows of the window, oldest first.
    pub source: Vec<Record>,
    /// Keyed by the dependency's full component name.
    pub dependencies: BTreeMap<String, DependencyRows>,
}

/// What a harvester produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HarvestOutput {
    /// Computed, but nothing to say. Still persisted.
    Nothing,
    One(Payload),
    /// One entry per source row, for `multiple_results` harvesters.
    Many(Vec<Option<Payload>>),
}

/// Transforms a window of source rows into derived output.
///
/// Must be deterministic for identical inputs: a step that returns
/// [`HarvestOutput::Nothing`] still counts as progress.
#[async_trait]
pub trait Harvester: Send + Sync {
    async fn run(&self, input: HarvestInput) -> anyhow::Result<HarvestOutput>;
}

// ═══════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter type '{0}' (expected int, float, bool or str)")]
    UnknownType(String),
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("missing required parameter '{0}'")]
    Missing(String),
    #[error("parameter '{name}' expects {expected}, got '{value}'")]
    Malformed {
        name: String,
        expected: ParamType,
        value: String,
    },
    /// Well-typed, but outside what the handler accepts. Raised by handlers
    /// and answered like the other parameter errors.
    #[error("parameter '{name}' must be {allowed}, got '{value}'")]
    OutOfRange {
        name: String,
        allowed: String,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Str => "str",
        })
    }
}

/// One declared query parameter, e.g. `"int?"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub ty: ParamType,
    pub optional: bool,
}

impl FromStr for ParamSpec {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, optional) = match s.strip_suffix('?') {
            Some(base) => (base, true),
            None => (s, false),
        };
        let ty = match base {
            "int" => ParamType::Int,
            "float" => ParamType::Float,
            "bool" => ParamType::Bool,
            "str" => ParamType::Str,
            other => return Err(ParamError::UnknownType(other.to_string())),
        };
        Ok(ParamSpec { ty, optional })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ParamValue {
    fn parse(name: &str, ty: ParamType, raw: &str) -> Result<Self, ParamError> {
        let malformed = || ParamError::Malformed {
            name: name.to_string(),
            expected: ty,
            value: raw.to_string(),
        };
        match ty {
            ParamType::Int => raw.parse().map(ParamValue::Int).map_err(|_| malformed()),
            ParamType::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ParamValue::Float)
                .ok_or_else(malformed),
            ParamType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ParamValue::Bool(true)),
                "false" | "0" | "no" => Ok(ParamValue::Bool(false)),
                _ => Err(malformed()),
            },
            ParamType::Str => Ok(ParamValue::Str(raw.to_string())),
        }
    }
}

/// Validated, typed query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    /// Check raw query-string pairs against the declared parameters.
    ///
    /// Unknown names, missing required names and values that do not
    /// parse as the declared type are all rejected.
    pub fn validate(
        declared: &BTreeMap<String, ParamSpec>,
        raw: &HashMap<String, String>,
    ) -> Result<Self, ParamError> {
        let mut unknown: Vec<&String> = raw.keys().filter(|k| !declared.contains_key(*k)).collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(ParamError::Unknown((*name).clone()));
        }

        let mut values = BTreeMap::new();
        for (name, spec) in declared {
            match raw.get(name) {
                Some(value) => {
                    values.insert(name.clone(), ParamValue::parse(name, spec.ty, value)?);
                }
                None if spec.optional => {}
                None => return Err(ParamError::Missing(name.clone())),
            }
        }
        Ok(Params(values))
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ParamValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// Read-only view of the store handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    store: Arc<dyn Store>,
}

impl HandlerContext {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn query(
        &self,
        collection: &str,
        query: &ItemQuery,
    ) -> Result<Vec<StoredItem>, StoreError> {
        self.store.query(collection, query).await
    }

    pub async fn latest(&self, collection: &str) -> Result<Option<StoredItem>, StoreError> {
        self.store.latest(collection).await
    }
}

/// Serves one named query over stored collections.
#[async_trait]
pub trait Handler: Send + Sync {
    /// `Ok(None)` means "nothing here" and is answered with 404.
    async fn run(&self, params: &Params, ctx: &HandlerContext) -> anyhow::Result<Option<Payload>>;
}

/// A built component: the closed set of roles.
#[derive(Clone)]
pub enum Component {
    Collector(Arc<dyn Collector>),
    Harvester(Arc<dyn Harvester>),
    Handler(Arc<dyn Handler>),
}

impl Component {
    pub fn role(&self) -> Role {
        match self {
            Component::Collector(_) => Role::Collector,
            Component::Harvester(_) => Role::Harvester,
            Component::Handler(_) => Role::Handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> BTreeMap<String, ParamSpec> {
        [
            ("start", "int?"),
            ("limit", "int"),
            ("ratio", "float?"),
            ("full", "bool?"),
            ("line", "str?"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.parse().unwrap()))
        .collect()
    }

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_param_spec_parsing() {
        assert_eq!(
            "int?".parse::<ParamSpec>(),
            Ok(ParamSpec {
                ty: ParamType::Int,
                optional: true
            })
        );
        assert_eq!(
            "str".parse::<ParamSpec>(),
            Ok(ParamSpec {
                ty: ParamType::Str,
                optional: false
            })
        );
        assert_eq!(
            "date".parse::<ParamSpec>(),
            Err(ParamError::UnknownType("date".into()))
        );
    }

    #[test]
    fn test_valid_params_are_typed() {
        let params = Params::validate(
            &declared(),
            &raw(&[("limit", "10"), ("ratio", "0.5"), ("full", "true"), ("line", "12")]),
        )
        .unwrap();
        assert_eq!(params.int("limit"), Some(10));
        assert_eq!(params.int("start"), None);
        assert_eq!(params.float("ratio"), Some(0.5));
        assert_eq!(params.bool("full"), Some(true));
        assert_eq!(params.str("line"), Some("12"));
    }

    #[test]
    fn test_unknown_missing_and_malformed_are_rejected() {
        assert_eq!(
            Params::validate(&declared(), &raw(&[("limit", "1"), ("bogus", "x")])),
            Err(ParamError::Unknown("bogus".into()))
        );
        assert_eq!(
            Params::validate(&declared(), &raw(&[])),
            Err(ParamError::Missing("limit".into()))
        );
        assert!(matches!(
            Params::validate(&declared(), &raw(&[("limit", "ten")])),
            Err(ParamError::Malformed { .. })
        ));
        assert!(matches!(
            Params::validate(&declared(), &raw(&[("limit", "1"), ("full", "maybe")])),
            Err(ParamError::Malformed { .. })
        ));
        assert!(matches!(
            Params::validate(&declared(), &raw(&[("limit", "1"), ("ratio", "NaN")])),
            Err(ParamError::Malformed { .. })
        ));
    }

    #[test]
    fn test_dependency_rows_latest() {
        let row = |ts| Record {
            timestamp: ts,
            payload: None,
        };
        assert_eq!(DependencyRows::Snapshot(row(3)).latest().unwrap().timestamp, 3);
        let history = DependencyRows::History(vec![row(1), row(2)]);
        assert_eq!(history.latest().unwrap().timestamp, 2);
        assert_eq!(history.records().len(), 2);
        assert!(DependencyRows::History(vec![]).latest().is_none());
    }
}
