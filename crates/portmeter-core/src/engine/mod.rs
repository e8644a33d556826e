//! Core poll engine
//!
//! The MeterEngine is responsible for:
//! - Detecting day and month boundary crossings
//! - Initializing the new day's records for every monitored stream
//! - Aggregating the month that just closed
//! - Polling every stream once per cycle and persisting the reconciled totals
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!        tick ────────▶│ MeterEngine  │
//!                      └──────────────┘
//!                             │
//!          ┌──────────────────┼──────────────────┐
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//! ┌─────────────────┐ ┌──────────────┐ ┌───────────────────┐
//! │  DailyTracker   │ │    Events    │ │ MonthlyAggregator │
//! │ (read+reconcile)│ │   (notify)   │ │   (month rollup)  │
//! └─────────────────┘ └──────────────┘ └───────────────────┘
//!     │         │                              │
//!     ▼         ▼                              ▼
//! ┌────────┐ ┌─────────────────────────────────────┐
//! │Counter │ │             RecordStore             │
//! │Source  │ └─────────────────────────────────────┘
//! └────────┘
//! ```
//!
//! ## Tick Order
//!
//! 1. Date changed → initialize every stream for the new date
//! 2. Month changed → aggregate the previous month
//! 3. Poll every stream
//!
//! The date rollover runs first so that the closing month's last record is
//! no longer written to when it is summed.

pub mod daily;
pub mod monthly;
pub mod reconcile;
pub mod retry;

pub use daily::{DailyTracker, InitOutcome, PollOutcome};
pub use monthly::MonthlyAggregator;
pub use reconcile::{Reconciled, classify, reconcile};
pub use retry::StoreRetry;

use chrono::{DateTime, Local, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::MeterConfig;
use crate::error::Result;
use crate::model::{StreamKey, YearMonth};
use crate::traits::{CounterSource, RecordStore};

/// Events emitted by the MeterEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started
    Started { streams_count: usize },

    /// A new date was entered and its records initialized
    DayStarted {
        date: NaiveDate,
        created: usize,
        already_present: usize,
        skipped: usize,
    },

    /// A closed month was rolled up
    MonthAggregated { month: YearMonth, streams: usize },

    /// A reading was reconciled into a daily record
    CounterUpdated {
        stream: StreamKey,
        date: NaiveDate,
        delta: u64,
        day_total: u64,
    },

    /// A reading went backwards and was treated as a counter reset
    CounterReset {
        stream: StreamKey,
        last_raw: u64,
        new_raw: u64,
    },

    /// A counter could not be read; the stream was skipped this cycle
    CounterReadFailed { stream: StreamKey, error: String },

    /// A poll cycle aborted on a store error
    TickFailed { error: String },

    /// Engine stopped
    Stopped { reason: String },
}

/// Day and month markers carried from one tick to the next
///
/// The markers are derived from the store at startup (see
/// [`MeterEngine::startup_calendar`]) and are the only state the engine
/// keeps between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    /// Date whose records were last initialized (`None`: nothing initialized yet)
    pub date: Option<NaiveDate>,
    /// Month whose daily records are still being written
    pub month: YearMonth,
}

/// Counts of what one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Records created, either by the day rollover or by a first poll
    pub initialized: usize,
    pub updated: usize,
    pub skipped: usize,
    pub resets: usize,
    /// Month aggregated during this tick and the number of streams written
    pub aggregated: Option<(YearMonth, usize)>,
}

/// Core poll engine
///
/// ## Lifecycle
///
/// 1. Create with [`MeterEngine::new()`]
/// 2. Start with [`MeterEngine::run()`]
/// 3. Engine ticks at the configured interval until a shutdown signal
/// 4. The record store is flushed before `run()` returns
///
/// ## Threading
///
/// Ticks never overlap: reads and writes happen sequentially on one task, so
/// no two writers ever touch the same record.
pub struct MeterEngine {
    store: Arc<dyn RecordStore>,
    tracker: DailyTracker,
    aggregator: MonthlyAggregator,
    streams: Vec<StreamKey>,
    poll_interval: Duration,
    retry: StoreRetry,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl MeterEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        source: Box<dyn CounterSource>,
        store: Box<dyn RecordStore>,
        config: MeterConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let source: Arc<dyn CounterSource> = Arc::from(source);
        let store: Arc<dyn RecordStore> = Arc::from(store);
        let retry = StoreRetry::from_config(&config.engine);
        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let engine = Self {
            tracker: DailyTracker::new(
                source,
                store.clone(),
                Duration::from_secs(config.engine.read_timeout_secs),
                retry,
            ),
            aggregator: MonthlyAggregator::new(store.clone(), retry),
            store,
            streams: config.streams(),
            poll_interval: Duration::from_secs(config.engine.poll_interval_secs),
            retry,
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    pub fn tracker(&self) -> &DailyTracker {
        &self.tracker
    }

    pub fn aggregator(&self) -> &MonthlyAggregator {
        &self.aggregator
    }

    pub fn streams(&self) -> &[StreamKey] {
        &self.streams
    }

    /// Re-derive the calendar markers from the store
    ///
    /// The date marker is the latest date with a daily record. The month
    /// marker is that date's month when it is earlier than the current month,
    /// so a month that closed while the process was down is still aggregated
    /// on the first tick. When the latest records already belong to the
    /// current month, the previous month is still selected if any of its
    /// streams lacks a monthly record: the process stopped after the new
    /// month's first day started but before the rollup finished.
    pub async fn startup_calendar(&self, now: DateTime<Local>) -> Result<Calendar> {
        let current_month = YearMonth::of(now.date_naive());
        let store = self.store.as_ref();
        let latest = self
            .retry
            .run("latest_daily_date", move || store.latest_daily_date())
            .await?;

        let month = match latest {
            Some(date) if YearMonth::of(date) < current_month => YearMonth::of(date),
            _ => {
                let previous = current_month.previous();
                if self.aggregator.is_pending(previous).await? {
                    previous
                } else {
                    current_month
                }
            }
        };
        if month != current_month {
            info!("Month {} has not been aggregated since last run", month);
        }

        Ok(Calendar {
            date: latest,
            month,
        })
    }

    /// Run one poll cycle as of `now`
    ///
    /// Markers advance only after their step succeeded; a store failure
    /// aborts the tick and the step is repeated on the next one.
    pub async fn tick_at(
        &self,
        calendar: &mut Calendar,
        now: DateTime<Local>,
    ) -> Result<TickSummary> {
        let today = now.date_naive();
        let month = YearMonth::of(today);
        let stamp = now.with_timezone(&Utc);
        let mut summary = TickSummary::default();

        if calendar.date != Some(today) {
            info!("Date changed: {}", today);
            summary.initialized += self.start_day(today, stamp).await?;
            calendar.date = Some(today);
        }

        if calendar.month != month {
            let closed = calendar.month;
            info!("Month changed: aggregating {}", closed);
            let written = self.aggregator.aggregate(closed, stamp).await?;
            self.emit_event(EngineEvent::MonthAggregated {
                month: closed,
                streams: written.len(),
            });
            summary.aggregated = Some((closed, written.len()));
            calendar.month = month;
        }

        for stream in &self.streams {
            match self.tracker.poll(*stream, today, stamp).await? {
                PollOutcome::Initialized(_) => summary.initialized += 1,
                PollOutcome::Updated {
                    record,
                    previous_raw,
                    reconciled,
                } => {
                    summary.updated += 1;
                    if reconciled.reset {
                        summary.resets += 1;
                        self.emit_event(EngineEvent::CounterReset {
                            stream: *stream,
                            last_raw: previous_raw,
                            new_raw: record.last_raw,
                        });
                    }
                    self.emit_event(EngineEvent::CounterUpdated {
                        stream: *stream,
                        date: today,
                        delta: reconciled.delta,
                        day_total: record.net(),
                    });
                }
                PollOutcome::Skipped { error } => {
                    summary.skipped += 1;
                    self.emit_event(EngineEvent::CounterReadFailed {
                        stream: *stream,
                        error,
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Run the engine
    ///
    /// Ticks at the configured interval until SIGINT (Ctrl-C) is received.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error (startup or final flush)
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine until `shutdown_rx` fires (or SIGINT when `None`)
    ///
    /// Embedding applications and the daemon use this to tie the engine to
    /// their own shutdown handling.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.emit_event(EngineEvent::Started {
            streams_count: self.streams.len(),
        });

        let mut calendar = self.startup_calendar(Local::now()).await?;
        debug!("Starting with calendar {:?}", calendar);

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        // Shutdown is only observed between ticks; a running tick finishes
        // its writes before the loop exits.
        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    self.run_tick(&mut calendar).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.emit_event(EngineEvent::Stopped {
                        reason: "Shutdown signal".to_string(),
                    });
                    break;
                }
            }
        }

        self.store.flush().await?;
        info!("Records flushed, engine stopped");

        Ok(())
    }

    async fn run_tick(&self, calendar: &mut Calendar) {
        match self.tick_at(calendar, Local::now()).await {
            Ok(summary) => debug!("Poll cycle finished: {:?}", summary),
            Err(e) => {
                error!("Poll cycle failed: {}", e);
                self.emit_event(EngineEvent::TickFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Initialize every stream for `date`; returns the number of records created
    async fn start_day(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<usize> {
        let (mut created, mut already_present, mut skipped) = (0, 0, 0);
        for stream in &self.streams {
            match self.tracker.initialize(*stream, date, now).await? {
                InitOutcome::Created(_) => created += 1,
                InitOutcome::AlreadyPresent(_) => already_present += 1,
                InitOutcome::Skipped { error } => {
                    skipped += 1;
                    self.emit_event(EngineEvent::CounterReadFailed {
                        stream: *stream,
                        error,
                    });
                }
            }
        }

        self.emit_event(EngineEvent::DayStarted {
            date,
            created,
            already_present,
            skipped,
        });
        Ok(created)
    }

    fn emit_event(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event receiver dropped");
            }
        }
    }
}
