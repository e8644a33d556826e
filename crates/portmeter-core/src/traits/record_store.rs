// # Record Store Trait
//
// Defines the interface for durable daily and monthly record storage.
//
// ## Purpose
//
// All durable engine state lives here. The engine holds nothing across poll
// cycles besides its calendar markers, so a restarted process resumes by
// re-reading the last persisted `DailyRecord` of each stream.
//
// ## Implementations
//
// - In-memory: `MemoryRecordStore`
// - JSON file: `FileRecordStore`
// - SQLite: `portmeter-store-sqlite` crate

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::{DailyRecord, MonthlyRecord, MonthlyTotal, StreamKey, YearMonth};

/// Trait for record store implementations
///
/// Keys are composite: `(port, rule, date)` for daily records and
/// `(port, rule, month)` for monthly records.
///
/// # Atomicity
///
/// `put_daily` and `put_monthly` are upserts of the whole record. A store
/// must never expose a record with only some of its fields updated.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage (files, databases, etc.)
/// - ✅ Cache state in memory (with explicit flush)
///
/// ## Forbidden Capabilities
/// - ❌ Compute deltas or totals beyond `sum_daily_net_for_month`
/// - ❌ Read counters (owned by `CounterSource`)
/// - ❌ Retry failed operations (owned by `MeterEngine`)
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get the daily record of `stream` for `date`
    ///
    /// # Returns
    ///
    /// - `Ok(Some(DailyRecord))`: The record
    /// - `Ok(None)`: No record for that day yet
    /// - `Err(Error)`: Storage error
    async fn get_daily(
        &self,
        stream: StreamKey,
        date: NaiveDate,
    ) -> Result<Option<DailyRecord>, crate::Error>;

    /// Insert or replace a daily record
    async fn put_daily(&self, record: &DailyRecord) -> Result<(), crate::Error>;

    /// Get the monthly record of `stream` for `month`
    async fn get_monthly(
        &self,
        stream: StreamKey,
        month: YearMonth,
    ) -> Result<Option<MonthlyRecord>, crate::Error>;

    /// Insert or replace a monthly record
    async fn put_monthly(&self, record: &MonthlyRecord) -> Result<(), crate::Error>;

    /// Sum `accumulated - base` over every daily record dated within `month`,
    /// grouped by stream
    ///
    /// Streams without any daily record in the month are absent from the result.
    async fn sum_daily_net_for_month(
        &self,
        month: YearMonth,
    ) -> Result<Vec<MonthlyTotal>, crate::Error>;

    /// The most recent date that has at least one daily record
    async fn latest_daily_date(&self) -> Result<Option<NaiveDate>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing record stores from configuration
#[async_trait]
pub trait RecordStoreFactory: Send + Sync {
    /// Create a RecordStore instance from configuration
    async fn create(
        &self,
        config: &crate::config::RecordStoreConfig,
    ) -> Result<Box<dyn RecordStore>, crate::Error>;
}
