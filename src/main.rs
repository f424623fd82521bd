//! # Mobility Harvester CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and schema |
//! | `harvest components` | List declared components and the catch-up order |
//! | `harvest collections` | List stored collections with bounds and counts |
//! | `harvest query <collection>` | Print stored items as JSON lines |
//! | `harvest run` | Run collectors, harvesters and handlers until Ctrl-C |
//! | `harvest catch-up` | Bring harvesters up to date in dependency order |
//! | `harvest serve` | Serve handlers only |
//!
//! ## Examples
//!
//! ```bash
//! # Poll feeds and derive trips, serving every handler
//! harvest run --collectors all --harvesters 'stib_*' --handlers all
//!
//! # One poll and one harvest step, then exit
//! harvest run --collectors stib.positions --harvesters stib.trips --now
//!
//! # Raw items of a collection between two timestamps
//! harvest query stib.positions --start 1700000000 --end 1700003600
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mobility_harvester::commands::{self, QueryArgs, RunArgs, ServeArgs};
use mobility_harvester::config;

/// Mobility Harvester: collect, derive and serve public-transport telemetry.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Component declarations live in the directory named by
/// `[components].dir`.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Collect, derive and serve public-transport telemetry",
    version,
    long_about = "Mobility Harvester polls operator feeds on a schedule, stores every \
    response in a deduplicating time-series store, derives collections such as \
    reconstructed trips in incremental windows, and serves them over HTTP."
)]
struct Cli {
    /// Path to the main configuration file.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set (e.g. `debug`, `mobility_harvester=trace`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Host, port and allow-list overrides for the read-server.
#[derive(clap::Args)]
struct ServeOpts {
    /// Interface to bind, overriding `[server].bind`.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overriding `[server].bind`.
    #[arg(long)]
    port: Option<u16>,

    /// Client addresses allowed to query handlers, replacing
    /// `[server].allowed_hosts`.
    #[arg(long, num_args = 1..)]
    allowed_hosts: Vec<String>,
}

impl From<ServeOpts> for ServeArgs {
    fn from(opts: ServeOpts) -> Self {
        ServeArgs {
            host: opts.host,
            port: opts.port,
            allowed_hosts: opts.allowed_hosts,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file and the `collections` and `items` tables.
    /// Safe to run multiple times.
    Init,

    /// List declared components.
    ///
    /// Loads and builds the whole component tree, so this doubles as a
    /// configuration check.
    Components,

    /// List stored collections.
    Collections,

    /// Print the items of a collection as JSON lines.
    Query {
        /// Collection name (`file_n` or `file.n`).
        collection: String,

        /// Earliest timestamp, inclusive.
        #[arg(long)]
        start: Option<i64>,

        /// Latest timestamp, inclusive.
        #[arg(long)]
        end: Option<i64>,

        /// Maximum number of items.
        #[arg(long)]
        limit: Option<u32>,

        /// Newest first.
        #[arg(long)]
        desc: bool,
    },

    /// Run the selected components until interrupted.
    ///
    /// Each option takes names, glob patterns, `all` or `*`. Collectors
    /// fire on their schedule, harvesters process windows as soon as they
    /// are ready, and handlers are served over HTTP.
    Run {
        /// Collectors to run.
        #[arg(long, num_args = 1..)]
        collectors: Vec<String>,

        /// Harvesters to run.
        #[arg(long, num_args = 1..)]
        harvesters: Vec<String>,

        /// Handlers to serve.
        #[arg(long, num_args = 1..)]
        handlers: Vec<String>,

        /// Fire each collector once, step each harvester once, then exit.
        #[arg(long)]
        now: bool,

        /// Stop everything on the first collector failure.
        #[arg(long)]
        fail_fast: bool,

        #[command(flatten)]
        serve: ServeOpts,
    },

    /// Bring harvesters up to date, prerequisites first.
    CatchUp {
        /// Harvesters to catch up; all of them when omitted.
        #[arg(long, num_args = 1..)]
        harvesters: Vec<String>,
    },

    /// Serve handlers without running collectors or harvesters.
    Serve {
        /// Handlers to serve; all of them when omitted.
        #[arg(long, num_args = 1..)]
        handlers: Vec<String>,

        #[command(flatten)]
        serve: ServeOpts,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::init(&cfg).await?,
        Commands::Components => commands::components(&cfg)?,
        Commands::Collections => commands::collections(&cfg).await?,
        Commands::Query {
            collection,
            start,
            end,
            limit,
            desc,
        } => {
            let args = QueryArgs {
                collection,
                start,
                end,
                limit,
                descending: desc,
            };
            commands::query(&cfg, &args).await?;
        }
        Commands::Run {
            collectors,
            harvesters,
            handlers,
            now,
            fail_fast,
            serve,
        } => {
            let args = RunArgs {
                collectors,
                harvesters,
                handlers,
                now,
                fail_fast,
                serve: serve.into(),
            };
            commands::run(&cfg, &args).await?;
        }
        Commands::CatchUp { harvesters } => commands::catch_up(&cfg, &harvesters).await?,
        Commands::Serve { handlers, serve } => {
            commands::serve(&cfg, &handlers, &serve.into()).await?
        }
    }

    Ok(())
}
