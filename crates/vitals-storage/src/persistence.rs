//! Periodic snapshot persistence for the in-memory backend.
//!
//! Active only with a positive flush interval: each tick writes the
//! snapshot file, and shutdown triggers one final write before the
//! loop exits. Startup restore treats a missing snapshot file as a
//! first run, not a failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::Storage;

pub struct PersistenceManager {
    store: Arc<dyn Storage>,
    interval: Duration,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn Storage>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Restore the store from its snapshot file. A missing file is
    /// logged and swallowed; anything else propagates.
    pub async fn restore(&self) -> StorageResult<()> {
        match self.store.restore_from_file().await {
            Ok(()) => {
                info!("storage restored from snapshot file");
                Ok(())
            }
            Err(StorageError::Snapshot(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("no snapshot file to restore, starting empty");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run the flush loop until the shutdown signal, then write one
    /// final snapshot.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            // Write-through mode: every store already flushes.
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "persistence loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.store.write_to_file().await {
                        error!(error = %e, "periodic snapshot write failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("persistence loop shutting down");
                    if let Err(e) = self.store.write_to_file().await {
                        error!(error = %e, "final snapshot write failed");
                    }
                    break;
                }
            }
        }
    }
}
