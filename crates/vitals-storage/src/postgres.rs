//! Postgres-backed metric store.
//!
//! Every `store`/`store_batch` call runs inside one transaction: each
//! metric is looked up by (id, type) and either updated (counters add
//! the incoming delta to the stored one, gauges overwrite) or
//! inserted. A failure anywhere rolls back the whole batch — stronger
//! cross-metric atomicity than the in-memory backend provides.
//! Snapshot-file hooks are unsupported here; durability is the
//! database's job.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use vitals_core::{Metric, MetricKind, MetricValue};

use crate::error::{StorageError, StorageResult};
use crate::{Data, Storage};

const BOOTSTRAP: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id    text NOT NULL,
    type  text NOT NULL,
    value double precision,
    delta bigint,
    PRIMARY KEY (id, type)
)";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database and bootstrap the metrics table.
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new().max_connections(8).connect(dsn).await?;
        sqlx::query(BOOTSTRAP).execute(&pool).await?;
        info!("postgres store connected");
        Ok(Self { pool })
    }

    /// Upsert one metric inside an open transaction.
    async fn store_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        metric: &Metric,
    ) -> StorageResult<()> {
        let kind = metric.kind().as_str();
        let existing: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT delta FROM metrics WHERE id = $1 AND type = $2")
                .bind(&metric.id)
                .bind(kind)
                .fetch_optional(&mut **tx)
                .await?;

        match (&metric.value, existing) {
            (MetricValue::Counter(delta), Some((stored,))) => {
                sqlx::query("UPDATE metrics SET delta = $1 WHERE id = $2 AND type = $3")
                    .bind(stored.unwrap_or(0) + delta)
                    .bind(&metric.id)
                    .bind(kind)
                    .execute(&mut **tx)
                    .await?;
            }
            (MetricValue::Counter(delta), None) => {
                sqlx::query("INSERT INTO metrics (id, type, delta) VALUES ($1, $2, $3)")
                    .bind(&metric.id)
                    .bind(kind)
                    .bind(delta)
                    .execute(&mut **tx)
                    .await?;
            }
            (MetricValue::Gauge(value), Some(_)) => {
                sqlx::query("UPDATE metrics SET value = $1 WHERE id = $2 AND type = $3")
                    .bind(value)
                    .bind(&metric.id)
                    .bind(kind)
                    .execute(&mut **tx)
                    .await?;
            }
            (MetricValue::Gauge(value), None) => {
                sqlx::query("INSERT INTO metrics (id, type, value) VALUES ($1, $2, $3)")
                    .bind(&metric.id)
                    .bind(kind)
                    .bind(value)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    fn row_to_metric(
        id: String,
        kind: MetricKind,
        value: Option<f64>,
        delta: Option<i64>,
    ) -> StorageResult<Metric> {
        match kind {
            MetricKind::Gauge => value
                .map(|v| Metric::gauge(id.clone(), v))
                .ok_or(StorageError::CorruptRow(id)),
            MetricKind::Counter => delta
                .map(|d| Metric::counter(id.clone(), d))
                .ok_or(StorageError::CorruptRow(id)),
        }
    }
}

#[async_trait]
impl Storage for PgStore {
    async fn load(&self, kind: MetricKind, name: &str) -> StorageResult<Metric> {
        let row: Option<(String, Option<f64>, Option<i64>)> =
            sqlx::query_as("SELECT id, value, delta FROM metrics WHERE type = $1 AND id = $2")
                .bind(kind.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((id, value, delta)) => Self::row_to_metric(id, kind, value, delta),
            None => Err(StorageError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }

    async fn load_all(&self) -> StorageResult<Data> {
        let rows: Vec<(String, String, Option<f64>, Option<i64>)> =
            sqlx::query_as("SELECT id, type, value, delta FROM metrics")
                .fetch_all(&self.pool)
                .await?;

        let mut data = Data::new();
        for (id, kind_str, value, delta) in rows {
            let Ok(kind) = MetricKind::parse(&kind_str) else {
                return Err(StorageError::CorruptRow(id));
            };
            let metric = Self::row_to_metric(id, kind, value, delta)?;
            data.entry(kind_str)
                .or_default()
                .insert(metric.id.clone(), metric);
        }
        Ok(data)
    }

    async fn store(&self, metric: Metric) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::store_in_tx(&mut tx, &metric).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_batch(&self, metrics: &[Metric]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        for metric in metrics {
            // An error drops the transaction, rolling back the batch.
            Self::store_in_tx(&mut tx, metric).await?;
        }
        tx.commit().await?;
        debug!(metrics = metrics.len(), "batch committed");
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn write_to_file(&self) -> StorageResult<()> {
        Err(StorageError::Unsupported("snapshot write"))
    }

    async fn restore_from_file(&self) -> StorageResult<()> {
        Err(StorageError::Unsupported("snapshot restore"))
    }
}
