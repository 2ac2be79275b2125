//! PostgreSQL [`Store`] on `sqlx`.
//!
//! Each chunk becomes one multi-row statement against the `tickers` table:
//!
//! ```sql
//! INSERT INTO tickers (timestamp, exchange, base_symbol, quote_symbol, open, ...)
//! VALUES (to_timestamp($1 / 1000.0), $2, ...), (...)
//! ON CONFLICT (timestamp, exchange, base_symbol, quote_symbol) DO NOTHING
//! ```
//!
//! Rows the conflict clause skipped do not count in `rows_affected`, which
//! gives the inserted/skipped split of [`UpsertSummary`].

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tf_core::config::StoreConfig;
use tf_core::error::{ErrorCode, StorageError};
use tracing::{debug, info};

use crate::store::{Store, TickerRow, UpsertSummary};

const INSERT_PREFIX: &str = "INSERT INTO tickers (timestamp, exchange, base_symbol, quote_symbol, \
     open, high, low, close, last, previous_close, change, percentage, base_volume, quote_volume) ";

const ON_CONFLICT: &str = " ON CONFLICT (timestamp, exchange, base_symbol, quote_symbol) DO NOTHING";

/// Bind parameters per row.
const COLUMNS: usize = 14;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / COLUMNS;

/// Map a driver error onto the network-style codes the consumer classifies.
pub fn storage_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Io(e) => StorageError::from(e),
        sqlx::Error::PoolTimedOut => {
            StorageError::new(ErrorCode::TimedOut, "timed out acquiring a connection")
        }
        sqlx::Error::PoolClosed => StorageError::new(ErrorCode::ConnectionReset, "pool closed"),
        sqlx::Error::Database(db) => {
            let code = db.code().map_or_else(|| "DATABASE".to_string(), |c| c.into_owned());
            StorageError::new(ErrorCode::Other(code), db.message().to_string())
        }
        other => StorageError::new(ErrorCode::Other("DRIVER".into()), other.to_string()),
    }
}

/// Build the insert for one slice of rows (at most [`MAX_ROWS_PER_STATEMENT`]).
fn insert_statement(rows: &[TickerRow]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(INSERT_PREFIX);
    qb.push_values(rows, |mut b, row| {
        // Millisecond epoch in, timestamptz stored.
        b.push("to_timestamp(")
            .push_bind_unseparated(row.timestamp as f64)
            .push_unseparated(" / 1000.0)");
        b.push_bind(row.source.as_str())
            .push_bind(row.base_symbol.as_str())
            .push_bind(row.quote_symbol.as_str())
            .push_bind(row.open)
            .push_bind(row.high)
            .push_bind(row.low)
            .push_bind(row.close)
            .push_bind(row.last)
            .push_bind(row.previous_close)
            .push_bind(row.change)
            .push_bind(row.percentage)
            .push_bind(row.base_volume)
            .push_bind(row.quote_volume);
    });
    qb.push(ON_CONFLICT);
    qb
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open the pool and check out one connection, so an unreachable or
    /// misconfigured database fails here rather than on the first chunk.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.effective_max_connections())
            .acquire_timeout(cfg.connect_timeout())
            .connect(&cfg.effective_url())
            .await
            .map_err(storage_error)?;
        info!(
            "[postgres] pool ready ({} connections max)",
            cfg.effective_max_connections()
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn batch_upsert(&self, rows: &[TickerRow]) -> Result<UpsertSummary, StorageError> {
        let mut summary = UpsertSummary::default();
        for slice in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let result = insert_statement(slice)
                .build()
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            let inserted = (result.rows_affected() as usize).min(slice.len());
            summary.inserted += inserted;
            summary.skipped += slice.len() - inserted;
        }
        debug!(
            "[postgres] upserted {} rows ({} skipped)",
            summary.inserted, summary.skipped
        );
        Ok(summary)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
