//! vitals-agent — samples process/host metrics and ships them to the
//! collector.
//!
//! # Usage
//!
//! ```text
//! vitals-agent --address 127.0.0.1:8080 --poll-interval 2 --report-interval 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use vitals_agent::{
    Emitter, HostSampler, RetryPolicy, RuntimeSampler, SnapshotBuffer, Transport, run_workers,
};

#[derive(Parser)]
#[command(name = "vitals-agent", about = "vitals metrics agent")]
struct Cli {
    /// Collector address (host:port).
    #[arg(long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Sampling interval in seconds (both samplers).
    #[arg(long, default_value = "2")]
    poll_interval: u64,

    /// Batch report interval in seconds.
    #[arg(long, default_value = "10")]
    report_interval: u64,

    /// Number of concurrent delivery workers.
    #[arg(long, default_value = "3")]
    rate_limit: usize,

    /// Shared HMAC key for batch signatures.
    #[arg(long)]
    key: Option<String>,

    /// Path to a PEM RSA public key; enables payload encryption
    /// (mutually exclusive with signing).
    #[arg(long)]
    crypto_key: Option<PathBuf>,

    /// Seconds to wait for in-flight deliveries after shutdown.
    #[arg(long, default_value = "5")]
    grace_period: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vitals_agent=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let public_key = cli
        .crypto_key
        .as_deref()
        .map(vitals_core::crypto::load_public_key)
        .transpose()?;
    let hmac_key = match (&public_key, cli.key) {
        (Some(_), Some(_)) => {
            warn!("both --key and --crypto-key given; encryption wins, signature disabled");
            None
        }
        (_, key) => key.map(String::into_bytes),
    };

    let buffer = Arc::new(SnapshotBuffer::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (batch_tx, batch_rx) = mpsc::channel(1);

    let poll_interval = Duration::from_secs(cli.poll_interval);
    let runtime_sampler = RuntimeSampler::new(buffer.clone(), poll_interval);
    let host_sampler = HostSampler::new(buffer.clone(), poll_interval);
    let emitter = Emitter::new(buffer, Duration::from_secs(cli.report_interval));

    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { runtime_sampler.run(shutdown).await });
    }
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { host_sampler.run(shutdown).await });
    }
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { emitter.run(batch_tx, shutdown).await });
    }

    let transport = Arc::new(Transport::new(&cli.address, hmac_key, public_key)?);
    let workers = tokio::spawn(run_workers(
        cli.rate_limit,
        transport,
        RetryPolicy::standard(),
        batch_rx,
        shutdown_rx,
    ));

    info!(
        address = %cli.address,
        poll_interval = cli.poll_interval,
        report_interval = cli.report_interval,
        workers = cli.rate_limit,
        "agent started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Grace period for in-flight deliveries before hard exit.
    if tokio::time::timeout(Duration::from_secs(cli.grace_period), workers)
        .await
        .is_err()
    {
        warn!("grace period elapsed with deliveries still in flight");
    }

    info!("agent stopped");
    Ok(())
}
