//! vitalsd — the vitals collector daemon.
//!
//! Assembles the storage backend, snapshot persistence, and the HTTP
//! and gRPC APIs into one process:
//! - backend: Postgres when `--database-dsn` is set, in-memory
//!   otherwise; transient storage failures retried on a fixed
//!   schedule;
//! - persistence: restore-on-start plus a periodic (or write-through)
//!   snapshot, in-memory backend only;
//! - ingress: signature verification, optional decryption, optional
//!   trusted-subnet filtering, mirrored on the gRPC side as
//!   interceptors.
//!
//! # Usage
//!
//! ```text
//! vitalsd --address 127.0.0.1:8080 --file-storage-path /tmp/vitals.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use vitals_api::rpc::{self, metrics_server::MetricsServer};
use vitals_api::{ApiState, Subnet, build_router};
use vitals_storage::{MemoryStore, PersistenceManager, PgStore, RetryingStore, Storage};

#[derive(Parser)]
#[command(name = "vitalsd", about = "vitals collector daemon")]
struct Cli {
    /// Listen address (host:port).
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: String,

    /// gRPC listen address (host:port).
    #[arg(long, default_value = "127.0.0.1:8081")]
    rpc_address: SocketAddr,

    /// Snapshot interval in seconds; 0 means write-through.
    #[arg(long, default_value = "300")]
    store_interval: u64,

    /// Snapshot file path (in-memory backend only).
    #[arg(long, default_value = "/tmp/vitals-metrics.json")]
    file_storage_path: PathBuf,

    /// Restore the snapshot on startup.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    restore: bool,

    /// Postgres DSN; selects the database backend when set.
    #[arg(long)]
    database_dsn: Option<String>,

    /// Shared HMAC key for request signature verification.
    #[arg(long)]
    key: Option<String>,

    /// Path to a PEM RSA private key; enables batch decryption.
    #[arg(long)]
    crypto_key: Option<PathBuf>,

    /// CIDR of agents allowed to send metrics (checked via X-Real-IP).
    #[arg(long)]
    trusted_subnet: Option<Subnet>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vitalsd=debug,vitals=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let store_interval = Duration::from_secs(cli.store_interval);

    // Backend selection happens once at startup; a backend that fails
    // to initialize aborts the process.
    let file_backed = cli.database_dsn.is_none();
    let backend: Arc<dyn Storage> = match &cli.database_dsn {
        Some(dsn) => {
            let store = PgStore::connect(dsn).await?;
            info!("postgres backend ready");
            Arc::new(store)
        }
        None => {
            info!(path = ?cli.file_storage_path, "in-memory backend ready");
            Arc::new(MemoryStore::new(&cli.file_storage_path, store_interval))
        }
    };
    // Transient backend failures retry on the fixed schedule; misses
    // and validation errors pass straight through.
    let store: Arc<dyn Storage> = Arc::new(RetryingStore::standard(backend));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Snapshot persistence only applies to the file-backed store.
    let persistence = PersistenceManager::new(store.clone(), store_interval);
    if file_backed && cli.restore {
        persistence.restore().await?;
    }
    let persistence_handle = (file_backed && !store_interval.is_zero()).then(|| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { persistence.run(shutdown).await })
    });

    let mut state = ApiState::new(store);
    state.hmac_key = cli.key.map(String::into_bytes);
    state.private_key = cli
        .crypto_key
        .as_deref()
        .map(vitals_core::crypto::load_private_key)
        .transpose()?;
    state.trusted_subnet = cli.trusted_subnet;

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&cli.address).await?;
    info!(address = %cli.address, "collector listening");

    // gRPC mirror of the batch ingest surface.
    let rpc_handle = {
        let subnet = state.trusted_subnet;
        let service = rpc::MetricsService::new(state);
        let rpc_addr = cli.rpc_address;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            info!(address = %rpc_addr, "rpc server listening");
            let result = tonic::transport::Server::builder()
                .layer(tonic::service::interceptor(rpc::subnet_interceptor(subnet)))
                .add_service(MetricsServer::new(service))
                .serve_with_shutdown(rpc_addr, async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                error!(%err, "rpc server failed");
            }
        })
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // The persistence loop flushes a final snapshot before exiting.
    if let Some(handle) = persistence_handle {
        let _ = handle.await;
    }
    let _ = rpc_handle.await;

    info!("collector stopped");
    Ok(())
}
