//! TideKV server binary.
//!
//! Loads the configuration, replays the append-only file, then serves
//! clients until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use tidekv::config::{Config, Overrides};
use tidekv::db::Db;
use tidekv::server::Server;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tidekv", version, about = "In-memory key-value store speaking the Redis protocol")]
struct Args {
    /// redis.conf style configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to (default: 127.0.0.1)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (default: 6379)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the append-only file
    #[arg(long, value_parser = parse_yes_no)]
    appendonly: Option<bool>,

    /// Append-only file path (default: appendonly.aof)
    #[arg(long)]
    appendfilename: Option<PathBuf>,

    /// Require clients to AUTH with this password
    #[arg(long)]
    requirepass: Option<String>,

    /// Maximum connected clients, 0 for no limit (default: 10000)
    #[arg(long)]
    maxclients: Option<usize>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            maxclients: self.maxclients,
            appendonly: self.appendonly,
            appendfilename: self.appendfilename.clone(),
            requirepass: self.requirepass.clone(),
        }
    }
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        other => Err(format!("expected yes or no, got '{}'", other)),
    }
}

fn print_banner(config: &Config) {
    println!(
        r#"
  _   _     _       _
 | |_(_) __| | ___ | | ____   __
 | __| |/ _` |/ _ \| |/ /\ \ / /
 | |_| | (_| |  __/|   <  \ V /
  \__|_|\__,_|\___||_|\_\  \_/

TideKV v{} - In-Memory Key-Value Store
──────────────────────────────────────────────────────────────
Listening on {}
Append only file: {}

Use Ctrl+C to shutdown gracefully.
"#,
        tidekv::VERSION,
        config.bind_address(),
        if config.appendonly {
            config.appendfilename.display().to_string()
        } else {
            "disabled".to_string()
        }
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .with_overrides(args.overrides());

    let db = Db::open(config.db_options())?;
    info!(
        keys = db.len(),
        commands = db.commands().len(),
        appendonly = config.appendonly,
        "Database ready"
    );

    let server = Server::bind(&config.bind_address(), db.clone(), config.client_limit()).await?;
    print_banner(&config);
    info!("Listening on {}", config.bind_address());

    server
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Flushing append only file");
    db.close();
    info!("Server shutdown complete");
    Ok(())
}
