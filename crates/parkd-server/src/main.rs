//! parkd command-line entry point.
//!
//! ```bash
//! # Serve the default 238-slot lot on port 3000
//! parkd serve
//!
//! # Smaller lot, custom port
//! parkd serve --port 8080 --layout A:10,B:5
//!
//! # Follow a running server's occupancy from the terminal
//! parkd watch --url http://localhost:3000
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use parkd::transport::{ServerConfig, serve};
use parkd::{HttpFeedSource, LotLayout, ParkingService, SyncClient, SyncConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "parkd")]
#[command(version = parkd::PARKD_VERSION)]
#[command(about = "Parking slot allocation and live occupancy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the allocation server
    Serve(ServeArgs),

    /// Follow a server's occupancy feed and log changes
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0", env = "PARKD_HOST")]
    host: String,

    #[arg(long, default_value_t = 3000, env = "PARKD_PORT")]
    port: u16,

    /// Block layout, e.g. `A:20,B:24`. Defaults to the standard 238-slot lot.
    #[arg(long, env = "PARKD_LAYOUT")]
    layout: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long, default_value = "http://localhost:3000", env = "PARKD_URL")]
    url: String,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PARKD_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("parkd={level},parkd_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let layout = LotLayout::from_setting(args.layout.as_deref())
        .with_context(|| format!("invalid layout {:?}", args.layout.unwrap_or_default()))?;
    tracing::info!(layout = %layout, slots = layout.total_slots(), "Lot layout loaded");

    let service = Arc::new(ParkingService::new(layout));
    let config = ServerConfig {
        host: args.host,
        port: args.port,
    };
    serve(config, service).await
}

async fn run_watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = SyncConfig::default();
    let source = HttpFeedSource::with_config(&args.url, &config)
        .with_context(|| format!("cannot build client for {}", args.url))?;
    tracing::info!(url = %source.base_url(), "Watching occupancy");

    let handle = SyncClient::new(Arc::new(source), config).spawn();
    let mut view = handle.view();
    let mut status = handle.status();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let occupied: Vec<String> = view
                    .borrow_and_update()
                    .occupied()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                tracing::info!(count = occupied.len(), slots = %occupied.join(","), "Occupancy changed");
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.error {
                    Some(e) => tracing::error!(mode = ?current.mode, error = %e, "Occupancy unavailable"),
                    None => tracing::info!(mode = ?current.mode, "Sync status"),
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Watch(args) => run_watch(args).await,
    }
}
