//! Ticker storage seam.
//!
//! [`Store::batch_upsert`] writes one chunk of rows in a single call. Rows are
//! unique on `(timestamp, source, base_symbol, quote_symbol)`; a row whose key
//! already exists is skipped, never overwritten, so replaying a redelivered
//! chunk is harmless.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use async_trait::async_trait;
use tf_core::TickerSnapshot;
use tf_core::error::{ErrorCode, StorageError};

/// One stored ticker row.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerRow {
    pub timestamp: u64,
    pub source: String,
    pub base_symbol: String,
    pub quote_symbol: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub last: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub percentage: Option<f64>,
    pub base_volume: Option<f64>,
    pub quote_volume: Option<f64>,
}

/// Unique key of a [`TickerRow`].
pub type RowKey = (u64, String, String, String);

impl TickerRow {
    /// Build a row for `source`. `None` when the symbol is not `BASE/QUOTE`.
    pub fn from_snapshot(source: &str, t: &TickerSnapshot) -> Option<Self> {
        let pair = t.pair()?;
        Some(Self {
            timestamp: t.timestamp,
            source: source.to_string(),
            base_symbol: pair.base.to_string(),
            quote_symbol: pair.quote.to_string(),
            open: t.open,
            high: t.high,
            low: t.low,
            close: t.close,
            last: t.last,
            previous_close: t.previous_close,
            change: t.change,
            percentage: t.percentage,
            base_volume: t.base_volume,
            quote_volume: t.quote_volume,
        })
    }

    pub fn key(&self) -> RowKey {
        (
            self.timestamp,
            self.source.clone(),
            self.base_symbol.clone(),
            self.quote_symbol.clone(),
        )
    }
}

/// What one upsert did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    /// Rows whose key already existed.
    pub skipped: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert every row, skipping conflicting keys.
    async fn batch_upsert(&self, rows: &[TickerRow]) -> Result<UpsertSummary, StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// In-process [`Store`] used by local mode and tests. Nothing survives the
/// process; production runs use [`crate::PgStore`].
///
/// After [`Store::close`] every upsert fails with `ECONNRESET`, the same code
/// a dropped database connection reports.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<AHashMap<RowKey, TickerRow>>,
    upserts: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<RowKey, TickerRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored rows, ordered by key.
    pub fn rows(&self) -> Vec<TickerRow> {
        let mut rows: Vec<TickerRow> = self.lock().values().cloned().collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `batch_upsert` calls since creation.
    pub fn upsert_calls(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn batch_upsert(&self, rows: &[TickerRow]) -> Result<UpsertSummary, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::new(ErrorCode::ConnectionReset, "store closed"));
        }
        let mut summary = UpsertSummary::default();
        let mut stored = self.lock();
        for row in rows {
            match stored.entry(row.key()) {
                std::collections::hash_map::Entry::Occupied(_) => summary.skipped += 1,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(row.clone());
                    summary.inserted += 1;
                }
            }
        }
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(summary)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
