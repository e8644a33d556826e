// # Memory Record Store
//
// In-memory implementation of RecordStore.
//
// ## Purpose
//
// Provides a simple, fast record store that doesn't persist across restarts.
// Useful for testing and for dry runs against a live counter source.
//
// ## Crash Behavior
//
// - All records are lost on restart/crash
// - The first poll after a restart anchors a fresh daily record, so traffic
//   counted before the restart is no longer attributed to that day

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::tables::RecordTables;
use crate::Error;
use crate::config::RecordStoreConfig;
use crate::model::{DailyRecord, MonthlyRecord, MonthlyTotal, StreamKey, YearMonth};
use crate::traits::record_store::{RecordStore, RecordStoreFactory};

/// In-memory record store implementation
///
/// Records live in ordered maps protected by a RwLock. Clones share the
/// same tables.
///
/// # Example
///
/// ```rust,no_run
/// use portmeter_core::state::MemoryRecordStore;
/// use portmeter_core::traits::RecordStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryRecordStore::new();
///
///     let latest = store.latest_daily_date().await?;
///     assert_eq!(latest, None);
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<RecordTables>>,
}

impl MemoryRecordStore {
    /// Create a new empty memory record store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of daily records in the store
    pub async fn daily_len(&self) -> usize {
        self.inner.read().await.daily_len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_daily(&self, stream: StreamKey, date: NaiveDate) -> Result<Option<DailyRecord>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get_daily(stream, date).cloned())
    }

    async fn put_daily(&self, record: &DailyRecord) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.put_daily(record.clone());
        Ok(())
    }

    async fn get_monthly(
        &self,
        stream: StreamKey,
        month: YearMonth,
    ) -> Result<Option<MonthlyRecord>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get_monthly(stream, month).cloned())
    }

    async fn put_monthly(&self, record: &MonthlyRecord) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.put_monthly(record.clone());
        Ok(())
    }

    async fn sum_daily_net_for_month(&self, month: YearMonth) -> Result<Vec<MonthlyTotal>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.sum_daily_net_for_month(month))
    }

    async fn latest_daily_date(&self) -> Result<Option<NaiveDate>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.latest_daily_date())
    }

    async fn flush(&self) -> Result<(), Error> {
        // No-op for memory store (everything is already "persisted")
        Ok(())
    }
}

/// Factory registered under the name `memory`
pub struct MemoryRecordStoreFactory;

#[async_trait]
impl RecordStoreFactory for MemoryRecordStoreFactory {
    async fn create(&self, config: &RecordStoreConfig) -> Result<Box<dyn RecordStore>, Error> {
        match config {
            RecordStoreConfig::Memory => Ok(Box::new(MemoryRecordStore::new())),
            other => Err(Error::config(format!(
                "Memory store factory cannot build a '{}' store",
                other.type_name()
            ))),
        }
    }
}
