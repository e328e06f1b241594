//! vitals-storage — the collector's storage engine.
//!
//! One contract, two backends:
//!
//! - [`MemoryStore`]: a read-write-locked nested map with JSON snapshot
//!   persistence (periodic or write-through);
//! - [`PgStore`]: a Postgres table where every store call runs in one
//!   transaction.
//!
//! Both enforce the accumulation rule: gauges overwrite, counters sum
//! every delta ever applied to the identity. The backend is selected
//! once at startup; [`PersistenceManager`] drives the snapshot timer
//! for the in-memory backend only, and [`RetryingStore`] re-runs
//! transiently failed calls on a fixed delay schedule.

pub mod error;
pub mod memory;
pub mod persistence;
pub mod postgres;
pub mod retry;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use persistence::PersistenceManager;
pub use postgres::PgStore;
pub use retry::RetryingStore;

use vitals_core::{Metric, MetricKind};

/// Server-side metric map: kind → name → metric. Doubles as the
/// snapshot file shape (indented JSON, round-trips through restore).
pub type Data = BTreeMap<String, BTreeMap<String, Metric>>;

/// Storage engine contract shared by both backends.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch one metric by identity. Absence is the expected
    /// [`StorageError::NotFound`], not an infrastructure failure.
    async fn load(&self, kind: MetricKind, name: &str) -> StorageResult<Metric>;

    /// Fetch the full map.
    async fn load_all(&self) -> StorageResult<Data>;

    /// Upsert one metric under the accumulation rule.
    async fn store(&self, metric: Metric) -> StorageResult<()>;

    /// Apply every metric of a batch. Atomic on Postgres; per-metric on
    /// the in-memory backend.
    async fn store_batch(&self, metrics: &[Metric]) -> StorageResult<()>;

    /// Liveness probe.
    async fn ping(&self) -> StorageResult<()>;

    /// Write the snapshot file. `Unsupported` on Postgres.
    async fn write_to_file(&self) -> StorageResult<()>;

    /// Replace the map with the snapshot file contents. `Unsupported`
    /// on Postgres.
    async fn restore_from_file(&self) -> StorageResult<()>;
}
