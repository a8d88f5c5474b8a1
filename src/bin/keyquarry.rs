//! KeyQuarry Server Binary
//!
//! Command-line front end for the KeyQuarry server:
//! - Start the server (`serve`)
//! - Validate and print the effective configuration (`config`)
//! - Show the version (`version`)
//!
//! # Examples
//!
//! ```bash
//! # Start with defaults (tcp://127.0.0.1:11855)
//! keyquarry serve
//!
//! # Bind a unix socket, keep encrypted snapshots
//! KEYQUARRY_SNAPSHOT_SECRET_KEY=hunter2 keyquarry serve \
//!     --listen unix:///tmp/keyquarry.sock \
//!     --snapshot-dir /var/lib/keyquarry/snapshots --snapshot-encrypt
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use keyquarry::config::{parse_duration, ListenAddress, ServerConfig};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// KeyQuarry - in-memory key/value server
#[derive(Parser, Debug)]
#[command(name = "keyquarry")]
#[command(version = keyquarry::VERSION)]
#[command(about = "In-memory key/value server with locking, TTL and snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "KEYQUARRY_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "KEYQUARRY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit stdout logs as JSON
    #[arg(long, global = true, env = "KEYQUARRY_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the KeyQuarry server
    Serve(ServeArgs),

    /// Validate the configuration and print it
    Config,

    /// Show the server version
    Version,
}

/// Server overrides on top of the KEYQUARRY_* environment
#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Listen address (tcp://host:port or unix:///path)
    #[arg(short, long)]
    listen: Option<String>,

    /// HTTP monitor address (host:port)
    #[arg(long)]
    monitor: Option<String>,

    /// Maximum number of keys (0 = unlimited)
    #[arg(long)]
    max_keys: Option<u64>,

    /// Start in readonly mode
    #[arg(long)]
    readonly: bool,

    /// Skip snapshot restore on startup
    #[arg(long)]
    start_fresh: bool,

    /// Snapshot directory (enables snapshots)
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Snapshot SQLite database (enables snapshots, wins over --snapshot-dir)
    #[arg(long)]
    snapshot_database: Option<PathBuf>,

    /// Snapshot interval, e.g. "5m"
    #[arg(long)]
    snapshot_interval: Option<String>,

    /// Encrypt snapshots (requires KEYQUARRY_SNAPSHOT_SECRET_KEY)
    #[arg(long)]
    snapshot_encrypt: bool,

    /// Privileged client id
    #[arg(long)]
    privileged_client_id: Option<String>,

    /// Log every published event
    #[arg(long)]
    log_events: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config.log_json |= cli.log_json;

    match cli.command {
        Commands::Serve(ref args) => {
            apply_serve_args(&mut config, args.clone())?;
            config.validate()?;
            setup_logging(&cli, &config)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(keyquarry::server::start_server(config))
        }
        Commands::Config => {
            config.validate()?;
            println!("{:#?}", config);
            Ok(())
        }
        Commands::Version => {
            println!("keyquarry {}", keyquarry::VERSION);
            Ok(())
        }
    }
}

fn apply_serve_args(config: &mut ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(listen) = &args.listen {
        config.listen_address = ListenAddress::parse(listen)?;
    }
    if args.monitor.is_some() {
        config.monitor_address = args.monitor;
    }
    if let Some(max_keys) = args.max_keys {
        config.max_keys = max_keys;
    }
    config.readonly |= args.readonly;
    config.start_fresh |= args.start_fresh;
    config.log_events |= args.log_events;
    if args.snapshot_database.is_some() {
        config.snapshot.database = args.snapshot_database;
        config.snapshot.enabled = true;
    }
    if args.snapshot_dir.is_some() {
        config.snapshot.dir = args.snapshot_dir;
        config.snapshot.enabled = true;
    }
    if let Some(interval) = &args.snapshot_interval {
        config.snapshot.interval = parse_duration(interval)
            .ok_or_else(|| anyhow::anyhow!("bad snapshot interval {:?}", interval))?;
    }
    config.snapshot.encrypt |= args.snapshot_encrypt;
    if args.privileged_client_id.is_some() {
        config.privileged_client_id = args.privileged_client_id;
    }
    Ok(())
}

/// Logging with rolling files and console output
fn setup_logging(cli: &Cli, config: &ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "keyquarry.log");

    let log_level = if config.trace {
        tracing::Level::TRACE
    } else {
        config
            .log_level
            .parse::<tracing::Level>()
            .unwrap_or(tracing::Level::INFO)
    };
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stdout).json())
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stdout).pretty())
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .with(filter)
            .init();
    }

    info!(version = %keyquarry::VERSION, "logging initialized");
    Ok(())
}
