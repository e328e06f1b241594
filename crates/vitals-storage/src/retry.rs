//! Fixed-schedule retry decorator over the storage contract.
//!
//! Wraps any [`Storage`] and re-runs failed calls on a fixed delay
//! schedule, but only for transient errors (database outages, snapshot
//! I/O); `NotFound`, `Unsupported`, and decode errors surface
//! immediately. Exhausting the schedule surfaces the last error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use vitals_core::{Metric, MetricKind};

use crate::error::StorageResult;
use crate::{Data, Storage};

pub struct RetryingStore {
    inner: Arc<dyn Storage>,
    delays: Vec<Duration>,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn Storage>, delays: Vec<Duration>) -> Self {
        Self { inner, delays }
    }

    /// The schedule used by the collector: 1s, 3s, 5s.
    pub fn standard(inner: Arc<dyn Storage>) -> Self {
        Self::new(
            inner,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        )
    }

    async fn run<T, F, Fut>(&self, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut last = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };
        for delay in &self.delays {
            debug!(delay_ms = delay.as_millis() as u64, error = %last, "retrying storage call");
            tokio::time::sleep(*delay).await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[async_trait]
impl Storage for RetryingStore {
    async fn load(&self, kind: MetricKind, name: &str) -> StorageResult<Metric> {
        self.run(|| self.inner.load(kind, name)).await
    }

    async fn load_all(&self) -> StorageResult<Data> {
        self.run(|| self.inner.load_all()).await
    }

    async fn store(&self, metric: Metric) -> StorageResult<()> {
        self.run(|| self.inner.store(metric.clone())).await
    }

    async fn store_batch(&self, metrics: &[Metric]) -> StorageResult<()> {
        self.run(|| self.inner.store_batch(metrics)).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.run(|| self.inner.ping()).await
    }

    async fn write_to_file(&self) -> StorageResult<()> {
        self.run(|| self.inner.write_to_file()).await
    }

    async fn restore_from_file(&self) -> StorageResult<()> {
        self.run(|| self.inner.restore_from_file()).await
    }
}
