//! # Mobility Harvester
//!
//! A harvesting engine for public-transport telemetry: poll operator feeds
//! on a schedule, keep every response in a deduplicating time-series store,
//! derive new collections from old ones in incremental windows, and serve
//! the results over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  payload  ┌──────────────┐  window  ┌────────────┐
//! │ Collectors │──────────▶│    Store     │◀────────▶│ Harvesters │
//! │  (http)    │           │ SQLite/dedup │  output  │ trajectory │
//! └────────────┘           └──────┬───────┘          │  concat    │
//!                                 │                  └────────────┘
//!                                 ▼
//!                          ┌─────────────┐
//!                          │  Handlers   │  GET /{name}?start=..
//!                          │ read-server │
//!                          └─────────────┘
//! ```
//!
//! The store, the component traits, the dependency graph, the incremental
//! window step and trajectory reconstruction live in
//! [`mobility_harvester_core`]. This crate adds the SQLite backend,
//! configuration, the built-in implementations and the runtime.
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                                  # create database
//! harvest components                            # show the component tree
//! harvest run --collectors all --harvesters all --handlers all
//! harvest catch-up                              # rebuild derived data
//! harvest query stib.trips --limit 5
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Main TOML file and component tree |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite [`Store`](mobility_harvester_core::store::Store) backend |
//! | [`registry`] | Implementation factories |
//! | [`pipeline`] | Built components and CLI selection |
//! | [`collector_http`] | HTTP polling collector |
//! | [`harvester_trajectory`] | Trip reconstruction harvester |
//! | [`harvester_concat`] | Window archiving harvester |
//! | [`handler_range`] | Raw time-range handler |
//! | [`handler_trips`] | Trip summary handler |
//! | [`runner`] | Collector and harvester loops |
//! | [`server`] | Handler read-server |
//! | [`commands`] | CLI command implementations |

pub mod collector_http;
pub mod commands;
pub mod config;
pub mod db;
pub mod handler_range;
pub mod handler_trips;
pub mod harvester_concat;
pub mod harvester_trajectory;
pub mod migrate;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod server;
pub mod sqlite_store;
