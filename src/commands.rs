//! Command implementations behind the `harvest` binary.
//!
//! Each function loads what it needs from the [`Config`], does its work and
//! prints a human readable result. The binary only parses arguments.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use mobility_harvester_core::component::Role;
use mobility_harvester_core::graph::NodeId;
use mobility_harvester_core::store::{ItemQuery, Store};

use crate::config::{load_components, Config};
use crate::harvester_concat::payload_to_json;
use crate::pipeline::{Pipeline, Selection};
use crate::registry::ComponentRegistry;
use crate::runner::{self, ComponentReport, RunOptions};
use crate::server::{self, AllowList};
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// Open the database, apply the schema and wrap the pool in a store.
///
/// The pool is returned too so the caller can close it on exit.
pub async fn open_store(config: &Config) -> Result<(SqlitePool, Arc<dyn Store>)> {
    let pool = db::connect(config)
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
    migrate::apply(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    Ok((pool, store))
}

/// Load the component tree and build it with `registry`.
pub fn load_pipeline_with(config: &Config, registry: &ComponentRegistry) -> Result<Pipeline> {
    let specs = load_components(&config.components.dir)?;
    registry.build(specs)
}

/// Load the component tree with the built-in implementations.
pub fn load_pipeline(config: &Config) -> Result<Pipeline> {
    load_pipeline_with(config, &ComponentRegistry::with_builtins())
}

/// `harvest init`
pub async fn init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// `harvest components`: every declared component and the catch-up order.
pub fn components(config: &Config) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    if pipeline.specs().is_empty() {
        println!(
            "No components declared under {}",
            config.components.dir.display()
        );
        return Ok(());
    }

    println!(
        "{:<32} {:<10} {:<12} {:<6} DETAIL",
        "NAME", "ROLE", "IMPL", "KIND"
    );
    for spec in pipeline.specs() {
        let detail = match spec.role {
            Role::Collector => spec
                .schedule
                .map(|s| s.to_string())
                .unwrap_or_default(),
            Role::Harvester => {
                let mut detail = format!(
                    "{} over {}",
                    spec.source.as_deref().unwrap_or("?"),
                    spec.source_range
                );
                if !spec.dependencies.is_empty() {
                    let deps: Vec<String> = spec
                        .dependencies
                        .iter()
                        .map(|d| format!("{}[{}]", d.name, d.limit))
                        .collect();
                    detail.push_str(&format!(", needs {}", deps.join(" ")));
                }
                detail
            }
            Role::Handler => {
                let params: Vec<&str> = spec.query_parameters.keys().map(String::as_str).collect();
                format!("GET /{}?{}", spec.name, params.join("&"))
            }
        };
        println!(
            "{:<32} {:<10} {:<12} {:<6} {}",
            spec.name,
            spec.role.as_str(),
            spec.implementation,
            spec.kind.as_str(),
            detail
        );
    }

    let order = pipeline.graph().bootstrap_order();
    let names = |ids: &[NodeId]| {
        ids.iter()
            .map(|id| pipeline.spec(*id).name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!();
    println!("Catch-up order: {}", names(&order.order));
    if !order.unresolved.is_empty() {
        println!("Unresolved (cycle?): {}", names(&order.unresolved));
    }
    Ok(())
}

/// `harvest collections`: stored collections with bounds and counts.
pub async fn collections(config: &Config) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    let infos = store.collections().await?;
    pool.close().await;

    if infos.is_empty() {
        println!("No collections yet.");
        return Ok(());
    }
    println!(
        "{:<32} {:<6} {:>8} {:>8} {:>12} {:>12}",
        "COLLECTION", "KIND", "ITEMS", "BLOBS", "FIRST", "LAST"
    );
    let ts = |t: Option<i64>| t.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
    for info in infos {
        println!(
            "{:<32} {:<6} {:>8} {:>8} {:>12} {:>12}",
            info.name,
            info.kind.as_str(),
            info.count,
            info.blobs,
            ts(info.min_timestamp),
            ts(info.max_timestamp)
        );
    }
    Ok(())
}

/// Arguments of `harvest query`.
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub collection: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<u32>,
    pub descending: bool,
}

/// `harvest query`: one JSON line per stored item, copies resolved.
pub async fn query(config: &Config, args: &QueryArgs) -> Result<()> {
    let mut query = ItemQuery::all();
    if let Some(start) = args.start {
        query = query.since(start);
    }
    if let Some(end) = args.end {
        query = query.until(end);
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }
    if args.descending {
        query = query.descending();
    }

    let (pool, store) = open_store(config).await?;
    let collection = args.collection.replace('.', "_");
    let items = store.query(&collection, &query).await;
    pool.close().await;

    for item in items? {
        let timestamp = item.timestamp;
        let payload = item
            .payload()
            .with_context(|| format!("item at {} does not decode", timestamp))?;
        let line = serde_json::json!({
            "timestamp": timestamp,
            "data": payload_to_json(payload.as_ref()),
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

/// Where and to whom the read-server answers.
#[derive(Debug, Clone, Default)]
pub struct ServeArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Replaces `[server].allowed_hosts` when not empty.
    pub allowed_hosts: Vec<String>,
}

/// Arguments of `harvest run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub collectors: Vec<String>,
    pub harvesters: Vec<String>,
    pub handlers: Vec<String>,
    /// Fire collectors once and step harvesters once, then exit.
    pub now: bool,
    pub fail_fast: bool,
    pub serve: ServeArgs,
}

/// Effective bind address: `[server].bind` with CLI overrides.
pub fn bind_address(config: &Config, args: &ServeArgs) -> Result<SocketAddr> {
    let mut addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind '{}'", config.server.bind))?;
    if let Some(host) = &args.host {
        let ip = match host.as_str() {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other
                .parse()
                .with_context(|| format!("--host '{}' is not an IP address", other))?,
        };
        addr.set_ip(ip);
    }
    if let Some(port) = args.port {
        addr.set_port(port);
    }
    Ok(addr)
}

fn allow_list(config: &Config, args: &ServeArgs) -> Result<AllowList> {
    if args.allowed_hosts.is_empty() {
        AllowList::from_hosts(&config.server.allowed_hosts)
    } else {
        AllowList::from_hosts(&args.allowed_hosts)
    }
}

/// Bind the read-server and add it to the supervised tasks.
async fn spawn_server(
    tasks: &mut JoinSet<(String, Result<()>)>,
    config: &Config,
    args: &ServeArgs,
    store: &Arc<dyn Store>,
    pipeline: &Pipeline,
    handlers: &[NodeId],
) -> Result<()> {
    let addr = bind_address(config, args)?;
    let allow = allow_list(config, args)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let router = server::router(Arc::clone(store), pipeline, handlers, allow);
    tasks.spawn(async move {
        (
            "read-server".to_string(),
            server::serve(listener, router).await,
        )
    });
    Ok(())
}

fn print_reports(reports: &[ComponentReport]) {
    println!(
        "{:<32} {:<10} {:>7} {:>6}  STATUS",
        "COMPONENT", "ROLE", "WRITTEN", "STEPS"
    );
    for report in reports {
        let status = match (&report.error, &report.deferred) {
            (Some(e), _) => format!("error: {}", e),
            (None, Some(reason)) if report.steps == 0 => format!("waiting: {}", reason),
            _ => "ok".to_string(),
        };
        println!(
            "{:<32} {:<10} {:>7} {:>6}  {}",
            report.name, report.role, report.written, report.steps, status
        );
    }
}

/// `harvest run`: start the selected loops and read-server until Ctrl-C.
pub async fn run(config: &Config, args: &RunArgs) -> Result<()> {
    run_with(config, args, &ComponentRegistry::with_builtins()).await
}

/// [`run`] with a caller-supplied registry of implementations.
pub async fn run_with(config: &Config, args: &RunArgs, registry: &ComponentRegistry) -> Result<()> {
    let pipeline = load_pipeline_with(config, registry)?;
    let collectors = pipeline.select(Role::Collector, &Selection::parse(&args.collectors)?)?;
    let harvesters = pipeline.select(Role::Harvester, &Selection::parse(&args.harvesters)?)?;
    let handlers = pipeline.select(Role::Handler, &Selection::parse(&args.handlers)?)?;
    if collectors.is_empty() && harvesters.is_empty() && handlers.is_empty() {
        bail!("nothing to run: select components with --collectors, --harvesters or --handlers");
    }

    let mut options = RunOptions::from_config(&config.runner);
    if args.fail_fast {
        options.fail_fast = true;
    }

    let (pool, store) = open_store(config).await?;

    if args.now {
        if !handlers.is_empty() {
            warn!("handlers are not served with --now");
        }
        let result = runner::run_once(&store, &pipeline, &collectors, &harvesters, &options).await;
        pool.close().await;
        print_reports(&result?);
        return Ok(());
    }

    info!(
        collectors = collectors.len(),
        harvesters = harvesters.len(),
        handlers = handlers.len(),
        "starting"
    );
    let mut tasks = JoinSet::new();
    let started = async {
        runner::spawn_loops(
            &mut tasks,
            &store,
            &pipeline,
            &collectors,
            &harvesters,
            &options,
        )?;
        if !handlers.is_empty() {
            spawn_server(&mut tasks, config, &args.serve, &store, &pipeline, &handlers).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    let result = match started {
        Ok(()) => runner::supervise(tasks).await,
        Err(e) => {
            tasks.shutdown().await;
            Err(e)
        }
    };
    pool.close().await;
    result
}

/// `harvest catch-up`: bring harvesters up to date in dependency order.
pub async fn catch_up(config: &Config, harvesters: &[String]) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let selection = if harvesters.is_empty() {
        Selection::All
    } else {
        Selection::parse(harvesters)?
    };
    let selected = pipeline.select(Role::Harvester, &selection)?;

    let (pool, store) = open_store(config).await?;
    let result = runner::catch_up(&store, &pipeline, &selected).await;
    pool.close().await;
    print_reports(&result?);
    Ok(())
}

/// `harvest serve`: only the read-server, for the selected handlers.
pub async fn serve(config: &Config, handlers: &[String], args: &ServeArgs) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let selection = if handlers.is_empty() {
        Selection::All
    } else {
        Selection::parse(handlers)?
    };
    let selected = pipeline.select(Role::Handler, &selection)?;
    if selected.is_empty() {
        bail!("no handlers to serve");
    }

    let (pool, store) = open_store(config).await?;
    let mut tasks = JoinSet::new();
    let result = match spawn_server(&mut tasks, config, args, &store, &pipeline, &selected).await {
        Ok(()) => runner::supervise(tasks).await,
        Err(e) => Err(e),
    };
    pool.close().await;
    result
}
