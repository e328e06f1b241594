//! Batch emitter.
//!
//! On its own ticker the emitter copies the snapshot buffer and pushes
//! the batch onto a capacity-1 channel; a blocked send is the only
//! backpressure toward the samplers. On shutdown the sender is dropped
//! after any in-flight send, closing the channel — consumers must read
//! closure as "no more batches", never as an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use vitals_core::Metric;

use crate::buffer::SnapshotBuffer;

pub struct Emitter {
    buffer: Arc<SnapshotBuffer>,
    interval: Duration,
}

impl Emitter {
    pub fn new(buffer: Arc<SnapshotBuffer>, interval: Duration) -> Self {
        Self { buffer, interval }
    }

    /// Run until shutdown; consumes the sender so the channel closes
    /// when this returns.
    pub async fn run(self, tx: mpsc::Sender<Vec<Metric>>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "emitter started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let batch = self.buffer.snapshot();
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(metrics = batch.len(), "publishing batch");
                    if tx.send(batch).await.is_err() {
                        // All workers gone; nothing left to feed.
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    info!("emitter stopping");
                    return;
                }
            }
        }
    }
}
