//! herbtrack ledger daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! herbtrack
//!
//! # Start with custom config
//! herbtrack --config /path/to/config.toml
//!
//! # Custom port, storage and scan link base
//! herbtrack --http-port 9000 --storage-dir /data/herbtrack --scan-base-url https://trace.example
//!
//! # Gateway secret from the environment
//! GATEWAY_KEY_SECRET=... herbtrack
//! ```

use clap::Parser;
use herbtrack::codes::UrlCodeEncoder;
use herbtrack::gateway::HmacGateway;
use herbtrack::services::{events::spawn_logging_listener, Services};
use herbtrack::{Config, HttpServer, LedgerDb};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "herbtrack")]
#[command(about = "Herb supply-chain ledger: custody, settlement and provenance")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory for the ledger database
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Base URL embedded in batch and product scan codes
    #[arg(long, env = "SCAN_BASE_URL")]
    scan_base_url: Option<String>,

    /// Payment gateway key id
    #[arg(long, env = "GATEWAY_KEY_ID")]
    gateway_key_id: Option<String>,

    /// Payment gateway secret used to verify signatures
    #[arg(long, env = "GATEWAY_KEY_SECRET", hide_env_values = true)]
    gateway_key_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("herbtrack=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // CLI and env override the file
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.scan_base_url {
        config.scan_base_url = url;
    }
    if let Some(key_id) = args.gateway_key_id {
        config.gateway_key_id = key_id;
    }
    if let Some(secret) = args.gateway_key_secret {
        config.gateway_key_secret = secret;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        scan_base_url = %config.scan_base_url,
        "Starting herbtrack"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Write a default config file on first run, without the secret
    let config_path = config.config_path();
    if !config_path.exists() {
        let mut on_disk = config.clone();
        on_disk.gateway_key_secret.clear();
        on_disk.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    if config.gateway_key_secret.is_empty() {
        warn!("No gateway secret configured; Razorpay settlements will be rejected");
    }

    let db = Arc::new(LedgerDb::open_path(&config.ledger_db_path())?);
    let gateway = Arc::new(HmacGateway::new(
        config.gateway_key_id.clone(),
        config.gateway_key_secret.clone(),
        config.currency.clone(),
    ));
    let encoder = Arc::new(UrlCodeEncoder::new(&config.scan_base_url)?);

    let services = Arc::new(Services::new(db.clone(), gateway, encoder, &config.currency));
    let listener = spawn_logging_listener(services.events.clone());

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services, http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    listener.abort();

    if let Ok(stats) = db.stats() {
        info!(
            batches = stats.batch_count,
            events = stats.event_count,
            payments = stats.payment_count,
            products = stats.product_count,
            "Final ledger stats"
        );
    }

    Ok(())
}
