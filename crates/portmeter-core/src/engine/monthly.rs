//! Month-end rollup of daily records
//!
//! Totals are always recomputed from the persisted daily records and written
//! with an upsert, so aggregating the same month again (after a restart, or
//! from a retried tick) converges on the same value instead of adding twice.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::retry::StoreRetry;
use crate::error::Result;
use crate::model::{MonthlyRecord, StreamKey, YearMonth};
use crate::traits::RecordStore;
use crate::util::format_bytes;

/// Computes and stores per-month totals
pub struct MonthlyAggregator {
    store: Arc<dyn RecordStore>,
    retry: StoreRetry,
}

impl MonthlyAggregator {
    pub fn new(store: Arc<dyn RecordStore>, retry: StoreRetry) -> Self {
        Self { store, retry }
    }

    /// Write one [`MonthlyRecord`] per stream that has daily records in `month`
    ///
    /// # Returns
    ///
    /// The records written, ordered by port then rule
    pub async fn aggregate(
        &self,
        month: YearMonth,
        now: DateTime<Utc>,
    ) -> Result<Vec<MonthlyRecord>> {
        let store = self.store.as_ref();
        let mut totals = self
            .retry
            .run("sum_daily_net_for_month", move || {
                store.sum_daily_net_for_month(month)
            })
            .await?;
        totals.sort_by_key(|row| (row.port, row.rule));

        let mut written = Vec::with_capacity(totals.len());
        for row in totals {
            let record = MonthlyRecord {
                port: row.port,
                rule: row.rule,
                month,
                total: row.total,
                last_update: now,
            };

            let pending = &record;
            self.retry
                .run("put_monthly", move || store.put_monthly(pending))
                .await?;

            info!(
                "Monthly total {} port {} {}: {} ({})",
                month,
                record.port,
                record.rule,
                record.total,
                format_bytes(record.total)
            );
            written.push(record);
        }

        Ok(written)
    }

    /// Whether `month` has daily records for a stream with no monthly record yet
    pub async fn is_pending(&self, month: YearMonth) -> Result<bool> {
        let store = self.store.as_ref();
        let totals = self
            .retry
            .run("sum_daily_net_for_month", move || {
                store.sum_daily_net_for_month(month)
            })
            .await?;

        for row in totals {
            let stream = StreamKey::new(row.port, row.rule);
            if self.monthly_total(stream, month).await?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The stored total of `stream` for `month`, if that month was aggregated
    pub async fn monthly_total(&self, stream: StreamKey, month: YearMonth) -> Result<Option<u64>> {
        let store = self.store.as_ref();
        let record = self
            .retry
            .run("get_monthly", move || store.get_monthly(stream, month))
            .await?;
        Ok(record.map(|r| r.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DailyRecord, Port, Rule};
    use crate::state::MemoryRecordStore;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn daily(port: u16, rule: &str, date: &str, base: u64, accumulated: u64) -> DailyRecord {
        let stream = StreamKey::new(Port(port), rule.parse::<Rule>().unwrap());
        let date: NaiveDate = date.parse().unwrap();
        let mut record = DailyRecord::anchored(stream, date, base, Utc::now());
        record.accumulated = accumulated;
        record
    }

    async fn seeded_store() -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        for record in [
            daily(12450, "input_tcp", "2024-05-01", 1000, 1500),
            daily(12450, "input_tcp", "2024-05-02", 1500, 2200),
            daily(12450, "output_udp", "2024-05-02", 0, 42),
            daily(12450, "input_tcp", "2024-06-01", 2200, 9000),
            daily(23333, "input_tcp", "2024-04-30", 0, 77),
        ] {
            store.put_daily(&record).await.unwrap();
        }
        store
    }

    fn aggregator(store: Arc<MemoryRecordStore>) -> MonthlyAggregator {
        MonthlyAggregator::new(store, StoreRetry::new(0, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_aggregate_sums_only_days_of_the_month() {
        let aggregator = aggregator(seeded_store().await);
        let month: YearMonth = "2024-05".parse().unwrap();

        let written = aggregator.aggregate(month, Utc::now()).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].rule.to_string(), "input_tcp");
        assert_eq!(written[0].total, 1200);
        assert_eq!(written[1].rule.to_string(), "output_udp");
        assert_eq!(written[1].total, 42);

        let stream = StreamKey::new(Port(23333), "input_tcp".parse().unwrap());
        assert_eq!(aggregator.monthly_total(stream, month).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reaggregation_is_idempotent() {
        let aggregator = aggregator(seeded_store().await);
        let month: YearMonth = "2024-05".parse().unwrap();
        let stream = StreamKey::new(Port(12450), "input_tcp".parse().unwrap());

        aggregator.aggregate(month, Utc::now()).await.unwrap();
        aggregator.aggregate(month, Utc::now()).await.unwrap();

        assert_eq!(aggregator.monthly_total(stream, month).await.unwrap(), Some(1200));
    }

    #[tokio::test]
    async fn test_pending_until_every_stream_is_aggregated() {
        let store = seeded_store().await;
        let aggregator = aggregator(store.clone());
        let may: YearMonth = "2024-05".parse().unwrap();
        assert!(aggregator.is_pending(may).await.unwrap());

        // Only one of the two May streams rolled up
        store
            .put_monthly(&MonthlyRecord {
                port: Port(12450),
                rule: "input_tcp".parse().unwrap(),
                month: may,
                total: 1200,
                last_update: Utc::now(),
            })
            .await
            .unwrap();
        assert!(aggregator.is_pending(may).await.unwrap());

        aggregator.aggregate(may, Utc::now()).await.unwrap();
        assert!(!aggregator.is_pending(may).await.unwrap());
        assert!(!aggregator.is_pending("2023-01".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_month_writes_nothing() {
        let aggregator = aggregator(seeded_store().await);
        let written = aggregator
            .aggregate("2023-01".parse().unwrap(), Utc::now())
            .await
            .unwrap();
        assert!(written.is_empty());
    }
}
