//! Per-(port, rule, day) record lifecycle
//!
//! Each key moves through two states: *absent* and *initialized*. The first
//! poll of a date anchors a fresh [`DailyRecord`] at the current raw reading;
//! every later poll that day reconciles the new reading against `last_raw`
//! and grows `accumulated`. Past days are never touched again.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::reconcile::{Reconciled, classify};
use super::retry::StoreRetry;
use crate::error::{Error, Result};
use crate::model::{DailyRecord, StreamKey};
use crate::traits::{CounterSource, RecordStore};
use crate::util::format_bytes;

/// Result of initializing a stream for a date
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new record was anchored at the current raw reading
    Created(DailyRecord),
    /// The date already had a record; nothing was written
    AlreadyPresent(DailyRecord),
    /// The counter could not be read; nothing was written
    Skipped { error: String },
}

/// Result of polling a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// First poll of the date: the record was created
    Initialized(DailyRecord),
    /// The reading was reconciled into the existing record
    Updated {
        record: DailyRecord,
        previous_raw: u64,
        reconciled: Reconciled,
    },
    /// The counter could not be read; the stored record is unchanged
    Skipped { error: String },
}

impl DailyRecord {
    /// Fold a new raw reading into the record
    ///
    /// `accumulated`, `last_raw` and `last_update` change together; the
    /// caller persists the whole record in one upsert.
    pub fn apply_reading(&mut self, new_raw: u64, now: DateTime<Utc>) -> Reconciled {
        let reconciled = classify(self.last_raw, new_raw);
        self.accumulated = self.accumulated.saturating_add(reconciled.delta);
        self.last_raw = new_raw;
        self.last_update = now;
        reconciled
    }
}

/// Owns the daily record lifecycle for every stream
pub struct DailyTracker {
    source: Arc<dyn CounterSource>,
    store: Arc<dyn RecordStore>,
    read_timeout: Duration,
    retry: StoreRetry,
}

impl DailyTracker {
    pub fn new(
        source: Arc<dyn CounterSource>,
        store: Arc<dyn RecordStore>,
        read_timeout: Duration,
        retry: StoreRetry,
    ) -> Self {
        Self {
            source,
            store,
            read_timeout,
            retry,
        }
    }

    /// Create the record of `stream` for `date` unless one already exists
    ///
    /// Re-running this for an initialized date is a no-op, so a restart in the
    /// middle of a day never re-anchors `base`.
    pub async fn initialize(
        &self,
        stream: StreamKey,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<InitOutcome> {
        if let Some(existing) = self.load(stream, date).await? {
            debug!("Daily record already exists: {} {}", date, stream);
            return Ok(InitOutcome::AlreadyPresent(existing));
        }

        match self.read(stream).await {
            Ok(raw) => Ok(InitOutcome::Created(self.anchor(stream, date, raw, now).await?)),
            Err(e) => {
                warn!("Skipping initialization of {} for {}: {}", stream, date, e);
                Ok(InitOutcome::Skipped {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Read the counter of `stream` and fold it into the record for `date`
    ///
    /// A stream without a record for `date` is initialized instead. Counter
    /// read failures are logged and reported as [`PollOutcome::Skipped`];
    /// store failures propagate.
    pub async fn poll(
        &self,
        stream: StreamKey,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome> {
        let existing = self.load(stream, date).await?;

        let raw = match self.read(stream).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Skipping {} this cycle: {}", stream, e);
                return Ok(PollOutcome::Skipped {
                    error: e.to_string(),
                });
            }
        };

        let Some(mut record) = existing else {
            return Ok(PollOutcome::Initialized(
                self.anchor(stream, date, raw, now).await?,
            ));
        };

        let previous_raw = record.last_raw;
        let reconciled = record.apply_reading(raw, now);
        if reconciled.reset {
            info!(
                "{} counter reset ({} -> {}), delta = {} ({})",
                stream,
                previous_raw,
                raw,
                reconciled.delta,
                format_bytes(reconciled.delta)
            );
        }

        self.save(&record).await?;
        info!(
            "Updated daily {} {}: accumulated = {} ({}), day total = {} ({})",
            date,
            stream,
            record.accumulated,
            format_bytes(record.accumulated),
            record.net(),
            format_bytes(record.net())
        );

        Ok(PollOutcome::Updated {
            record,
            previous_raw,
            reconciled,
        })
    }

    /// Net traffic of `stream` on `date` so far (0 before the first poll)
    pub async fn current(&self, stream: StreamKey, date: NaiveDate) -> Result<u64> {
        Ok(self
            .load(stream, date)
            .await?
            .map(|record| record.net())
            .unwrap_or(0))
    }

    async fn anchor(
        &self,
        stream: StreamKey,
        date: NaiveDate,
        raw: u64,
        now: DateTime<Utc>,
    ) -> Result<DailyRecord> {
        let record = DailyRecord::anchored(stream, date, raw, now);
        self.save(&record).await?;
        info!(
            "Created daily record {} {}: base {} ({})",
            date,
            stream,
            raw,
            format_bytes(raw)
        );
        Ok(record)
    }

    async fn read(&self, stream: StreamKey) -> Result<u64> {
        let read = self.source.read_counter(stream.port, stream.rule);
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "{} read of {} exceeded {:?}",
                self.source.source_name(),
                stream,
                self.read_timeout
            ))),
        }
    }

    async fn load(&self, stream: StreamKey, date: NaiveDate) -> Result<Option<DailyRecord>> {
        let store = self.store.as_ref();
        self.retry
            .run("get_daily", move || store.get_daily(stream, date))
            .await
    }

    async fn save(&self, record: &DailyRecord) -> Result<()> {
        let store = self.store.as_ref();
        self.retry
            .run("put_daily", move || store.put_daily(record))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, Port, Protocol, Rule};
    use crate::state::MemoryRecordStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of readings; `None` is a failed read
    struct Scripted(Mutex<VecDeque<Option<u64>>>);

    impl Scripted {
        fn new(readings: &[Option<u64>]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(readings.iter().copied().collect())))
        }
    }

    #[async_trait]
    impl CounterSource for Scripted {
        async fn read_counter(&self, _port: Port, _rule: Rule) -> Result<u64> {
            match self.0.lock().unwrap().pop_front() {
                Some(Some(raw)) => Ok(raw),
                _ => Err(Error::counter_source("nft unavailable")),
            }
        }

        fn source_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn stream() -> StreamKey {
        StreamKey::new(Port(12450), Rule::new(Direction::Input, Protocol::Tcp))
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn tracker(source: Arc<Scripted>, store: Arc<MemoryRecordStore>) -> DailyTracker {
        DailyTracker::new(
            source,
            store,
            Duration::from_secs(1),
            StoreRetry::new(0, Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_apply_reading_keeps_accumulated_above_base() {
        let mut record = DailyRecord::anchored(stream(), day(), 1000, Utc::now());
        for raw in [1500, 200, 0, 50, 50, 10_000] {
            record.apply_reading(raw, Utc::now());
            assert!(record.accumulated >= record.base);
            assert_eq!(record.last_raw, raw);
        }
        // 500 + 200 + 0 + 50 + 0 + 9950
        assert_eq!(record.net(), 10_700);
    }

    #[tokio::test]
    async fn test_first_poll_anchors_then_accumulates() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(Scripted::new(&[Some(1000), Some(1500), Some(200)]), store);

        let first = tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        let PollOutcome::Initialized(record) = first else {
            panic!("expected initialization, got {:?}", first);
        };
        assert_eq!((record.base, record.accumulated, record.last_raw), (1000, 1000, 1000));

        tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        assert_eq!(tracker.current(stream(), day()).await.unwrap(), 500);

        let third = tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        let PollOutcome::Updated { record, reconciled, previous_raw } = third else {
            panic!("expected update, got {:?}", third);
        };
        assert!(reconciled.reset);
        assert_eq!(previous_raw, 1500);
        assert_eq!(reconciled.delta, 200);
        assert_eq!(record.accumulated, 1700);
        assert_eq!(record.net(), 700);
    }

    #[tokio::test]
    async fn test_initialize_is_noop_when_record_exists() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(Scripted::new(&[Some(1000), Some(9999)]), store);

        let created = tracker.initialize(stream(), day(), Utc::now()).await.unwrap();
        let InitOutcome::Created(original) = created else {
            panic!("expected creation, got {:?}", created);
        };

        let again = tracker.initialize(stream(), day(), Utc::now()).await.unwrap();
        assert_eq!(again, InitOutcome::AlreadyPresent(original));
    }

    #[tokio::test]
    async fn test_failed_read_leaves_record_untouched() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(
            Scripted::new(&[Some(1000), Some(1500), None, Some(1800)]),
            store.clone(),
        );

        tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        let before = store.get_daily(stream(), day()).await.unwrap();

        let skipped = tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        assert!(matches!(skipped, PollOutcome::Skipped { .. }));
        assert_eq!(store.get_daily(stream(), day()).await.unwrap(), before);

        let resumed = tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        let PollOutcome::Updated { reconciled, record, .. } = resumed else {
            panic!("expected update, got {:?}", resumed);
        };
        assert_eq!(reconciled.delta, 300);
        assert_eq!(record.net(), 800);
    }

    #[tokio::test]
    async fn test_failed_read_during_initialization_creates_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(Scripted::new(&[None]), store.clone());

        let outcome = tracker.initialize(stream(), day(), Utc::now()).await.unwrap();
        assert!(matches!(outcome, InitOutcome::Skipped { .. }));
        assert_eq!(store.get_daily(stream(), day()).await.unwrap(), None);
        assert_eq!(tracker.current(stream(), day()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_read_times_out_as_skip() {
        struct Stuck;

        #[async_trait]
        impl CounterSource for Stuck {
            async fn read_counter(&self, _port: Port, _rule: Rule) -> Result<u64> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            }

            fn source_name(&self) -> &'static str {
                "stuck"
            }
        }

        let store = Arc::new(MemoryRecordStore::new());
        let tracker = DailyTracker::new(
            Arc::new(Stuck),
            store,
            Duration::from_millis(20),
            StoreRetry::new(0, Duration::from_millis(1)),
        );

        let outcome = tracker.poll(stream(), day(), Utc::now()).await.unwrap();
        let PollOutcome::Skipped { error } = outcome else {
            panic!("expected skip, got {:?}", outcome);
        };
        assert!(error.contains("Timed out"), "unexpected error: {}", error);
    }
}
