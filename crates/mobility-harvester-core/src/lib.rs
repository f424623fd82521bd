//! # Mobility Harvester Core
//!
//! Runtime-agnostic logic for Mobility Harvester: the payload model, the
//! deduplicated store abstraction, the three component roles, the
//! configuration dependency graph, incremental windowing and the vehicle
//! trajectory reconstruction algorithm.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O. The
//! application crate supplies the SQLite store, the schedulers and the
//! read-server on top of it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Payloads, stored items, collection listings |
//! | [`store`] | [`store::Store`] trait and in-memory backend |
//! | [`component`] | Collector / Harvester / Handler contracts |
//! | [`range`] | Source ranges and schedules |
//! | [`graph`] | Component graph and bootstrap ordering |
//! | [`incremental`] | One incremental harvest step |
//! | [`trajectory`] | Trip reconstruction from anonymous position reports |

pub mod component;
pub mod graph;
pub mod incremental;
pub mod models;
pub mod range;
pub mod store;
pub mod trajectory;
