//! In-memory metric store with JSON snapshot persistence.
//!
//! One read-write lock guards the map for the store's lifetime;
//! `store` holds the write lock across the whole read-modify-write so
//! concurrent counter upserts never lose an update. A zero flush
//! interval turns every store into a synchronous write-through to the
//! snapshot file; otherwise flushing is left to the
//! [`PersistenceManager`](crate::PersistenceManager) timer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use vitals_core::{Metric, MetricKind, MetricValue};

use crate::error::{StorageError, StorageResult};
use crate::{Data, Storage};

pub struct MemoryStore {
    data: RwLock<Data>,
    snapshot_path: PathBuf,
    flush_interval: Duration,
}

impl MemoryStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            data: RwLock::new(Data::new()),
            snapshot_path: snapshot_path.into(),
            flush_interval,
        }
    }

    /// Apply one metric to the map under the accumulation rule.
    fn apply(data: &mut Data, metric: Metric) {
        let bucket = data
            .entry(metric.kind().as_str().to_string())
            .or_default();
        match metric.value {
            MetricValue::Gauge(_) => {
                // Last write wins.
                bucket.insert(metric.id.clone(), metric);
            }
            MetricValue::Counter(delta) => {
                let entry = bucket
                    .entry(metric.id.clone())
                    .or_insert_with(|| Metric::counter(metric.id.clone(), 0));
                if let MetricValue::Counter(total) = &mut entry.value {
                    *total += delta;
                } else {
                    // Only reachable through a corrupted snapshot file.
                    entry.value = MetricValue::Counter(delta);
                }
            }
        }
    }

    /// Serialize the map as indented JSON to the snapshot path.
    fn persist(data: &Data, path: &Path) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(data)?;
        std::fs::write(path, &bytes)?;
        debug!(bytes = bytes.len(), path = %path.display(), "snapshot written");
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn load(&self, kind: MetricKind, name: &str) -> StorageResult<Metric> {
        let data = self.data.read().await;
        data.get(kind.as_str())
            .and_then(|bucket| bucket.get(name))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn load_all(&self) -> StorageResult<Data> {
        Ok(self.data.read().await.clone())
    }

    async fn store(&self, metric: Metric) -> StorageResult<()> {
        let mut data = self.data.write().await;
        Self::apply(&mut data, metric);
        if self.flush_interval.is_zero() {
            // Write-through: the flush happens under the write lock so
            // the file never lags a completed store.
            Self::persist(&data, &self.snapshot_path)?;
        }
        Ok(())
    }

    async fn store_batch(&self, metrics: &[Metric]) -> StorageResult<()> {
        // One metric at a time; no cross-metric atomicity on this backend.
        for metric in metrics {
            self.store(metric.clone()).await?;
        }
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn write_to_file(&self) -> StorageResult<()> {
        let data = self.data.read().await;
        Self::persist(&data, &self.snapshot_path)
    }

    async fn restore_from_file(&self) -> StorageResult<()> {
        let bytes = std::fs::read(&self.snapshot_path)?;
        let restored: Data = serde_json::from_slice(&bytes)?;
        let mut data = self.data.write().await;
        *data = restored;
        debug!(path = %self.snapshot_path.display(), "snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("metrics.json"), Duration::from_secs(300));
        (store, dir)
    }

    #[tokio::test]
    async fn counter_accumulates_deltas() {
        let (store, _dir) = test_store();

        for delta in [1, 2, 3, 4] {
            store.store(Metric::counter("PollCount", delta)).await.unwrap();
        }

        let metric = store.load(MetricKind::Counter, "PollCount").await.unwrap();
        assert_eq!(metric.counter_delta(), Some(10));
    }

    #[tokio::test]
    async fn gauge_last_write_wins() {
        let (store, _dir) = test_store();

        for value in [1.0, 99.5, 42.0] {
            store.store(Metric::gauge("Memory", value)).await.unwrap();
        }

        let metric = store.load(MetricKind::Gauge, "Memory").await.unwrap();
        assert_eq!(metric.gauge_value(), Some(42.0));
    }

    #[tokio::test]
    async fn load_missing_metric_is_not_found() {
        let (store, _dir) = test_store();
        let err = store.load(MetricKind::Gauge, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn same_name_different_kind_are_distinct_identities() {
        let (store, _dir) = test_store();
        store.store(Metric::gauge("x", 5.0)).await.unwrap();
        store.store(Metric::counter("x", 3)).await.unwrap();

        assert_eq!(
            store.load(MetricKind::Gauge, "x").await.unwrap().gauge_value(),
            Some(5.0)
        );
        assert_eq!(
            store.load(MetricKind::Counter, "x").await.unwrap().counter_delta(),
            Some(3)
        );
    }

    #[tokio::test]
    async fn concurrent_counter_stores_do_not_lose_updates() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.store(Metric::counter("hits", 5)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.store(Metric::counter("hits", 7)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let metric = store.load(MetricKind::Counter, "hits").await.unwrap();
        assert_eq!(metric.counter_delta(), Some(12));
    }

    #[tokio::test]
    async fn batch_applies_every_metric() {
        let (store, _dir) = test_store();
        let batch = vec![
            Metric::gauge("Memory", 10.0),
            Metric::counter("PollCount", 1),
            Metric::counter("PollCount", 1),
        ];
        store.store_batch(&batch).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all["gauge"].len(), 1);
        assert_eq!(all["counter"]["PollCount"].counter_delta(), Some(2));
    }

    #[tokio::test]
    async fn snapshot_round_trips_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let store = MemoryStore::new(&path, Duration::from_secs(300));
        store.store(Metric::gauge("Memory", 123.25)).await.unwrap();
        store.store(Metric::counter("PollCount", 9)).await.unwrap();
        store.write_to_file().await.unwrap();

        let restored = MemoryStore::new(&path, Duration::from_secs(300));
        restored.restore_from_file().await.unwrap();

        assert_eq!(
            restored.load_all().await.unwrap(),
            store.load_all().await.unwrap()
        );
    }

    #[tokio::test]
    async fn snapshot_file_is_indented_and_keyed_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let store = MemoryStore::new(&path, Duration::from_secs(300));
        store.store(Metric::counter("PollCount", 3)).await.unwrap();
        store.write_to_file().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'), "snapshot should be indented");
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["counter"]["PollCount"]["delta"], 3);
        assert_eq!(value["counter"]["PollCount"]["type"], "counter");
    }

    #[tokio::test]
    async fn zero_interval_flushes_on_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let store = MemoryStore::new(&path, Duration::ZERO);
        store.store(Metric::gauge("Memory", 1.0)).await.unwrap();

        // No explicit write_to_file: write-through already flushed.
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["gauge"]["Memory"]["value"], 1.0);
    }

    #[tokio::test]
    async fn restore_missing_file_reports_io_error() {
        let (store, _dir) = test_store();
        let err = store.restore_from_file().await.unwrap_err();
        match err {
            StorageError::Snapshot(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }
}
