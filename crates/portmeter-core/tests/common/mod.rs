//! Test doubles and common utilities for contract tests
//!
//! This module provides minimal test doubles that let contract tests drive
//! the engine tick by tick with controlled counter readings and store faults.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use portmeter_core::error::{Error, Result};
use portmeter_core::model::{DailyRecord, MonthlyRecord, MonthlyTotal, Port, Rule, StreamKey, YearMonth};
use portmeter_core::traits::{CounterSource, RecordStore};
use portmeter_core::{MemoryRecordStore, MeterConfig};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A counter source whose readings are set by the test
///
/// Streams without a reading (or marked failing) return an error.
/// Clones share the same readings.
#[derive(Clone, Default)]
pub struct ScriptedCounterSource {
    readings: Arc<Mutex<HashMap<StreamKey, u64>>>,
    failing: Arc<Mutex<Vec<StreamKey>>>,
    read_count: Arc<AtomicUsize>,
}

impl ScriptedCounterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw value returned for `stream` from now on
    pub fn set(&self, stream: StreamKey, raw: u64) {
        self.readings.lock().unwrap().insert(stream, raw);
    }

    /// Set the same raw value for every stream in `streams`
    pub fn set_all(&self, streams: &[StreamKey], raw: u64) {
        for stream in streams {
            self.set(*stream, raw);
        }
    }

    /// Make reads of `stream` fail until [`recover`](Self::recover) is called
    pub fn fail(&self, stream: StreamKey) {
        self.failing.lock().unwrap().push(stream);
    }

    pub fn recover(&self, stream: StreamKey) {
        self.failing.lock().unwrap().retain(|s| *s != stream);
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterSource for ScriptedCounterSource {
    async fn read_counter(&self, port: Port, rule: Rule) -> Result<u64> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let stream = StreamKey::new(port, rule);

        if self.failing.lock().unwrap().contains(&stream) {
            return Err(Error::counter_source(format!("{} unavailable", stream)));
        }

        self.readings
            .lock()
            .unwrap()
            .get(&stream)
            .copied()
            .ok_or_else(|| Error::counter_source(format!("no counter for {}", stream)))
    }

    fn source_name(&self) -> &'static str {
        "scripted"
    }
}

/// A record store wrapper that counts calls and can be told to fail
///
/// Clones share the underlying memory store and counters, so a test can
/// keep one handle while the engine owns another, or build a second
/// engine over the same records to simulate a restart.
#[derive(Clone, Default)]
pub struct ObservedStore {
    inner: MemoryRecordStore,
    put_daily_calls: Arc<AtomicUsize>,
    put_monthly_calls: Arc<AtomicUsize>,
    flush_calls: Arc<AtomicUsize>,
    total_calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    failing_calls: Arc<Mutex<Option<RangeInclusive<usize>>>>,
}

impl ObservedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only the calls whose 1-based sequence number falls in `calls`
    pub fn fail_calls(&self, calls: RangeInclusive<usize>) {
        *self.failing_calls.lock().unwrap() = Some(calls);
    }

    pub fn put_daily_calls(&self) -> usize {
        self.put_daily_calls.load(Ordering::SeqCst)
    }

    pub fn put_monthly_calls(&self) -> usize {
        self.put_monthly_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    /// Every store operation, including the failed attempts
    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub async fn daily(&self, stream: StreamKey, date: NaiveDate) -> Option<DailyRecord> {
        self.inner.get_daily(stream, date).await.unwrap()
    }

    pub async fn monthly(&self, stream: StreamKey, month: YearMonth) -> Option<MonthlyRecord> {
        self.inner.get_monthly(stream, month).await.unwrap()
    }

    /// Write a daily record directly, bypassing the failure switch
    pub async fn seed_daily(&self, record: DailyRecord) {
        self.inner.put_daily(&record).await.unwrap();
    }

    fn check(&self) -> Result<()> {
        let call = self.total_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_window = self
            .failing_calls
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|window| window.contains(&call));
        if in_window || self.failing.load(Ordering::SeqCst) {
            Err(Error::record_store("database is locked"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for ObservedStore {
    async fn get_daily(&self, stream: StreamKey, date: NaiveDate) -> Result<Option<DailyRecord>> {
        self.check()?;
        self.inner.get_daily(stream, date).await
    }

    async fn put_daily(&self, record: &DailyRecord) -> Result<()> {
        self.put_daily_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put_daily(record).await
    }

    async fn get_monthly(&self, stream: StreamKey, month: YearMonth) -> Result<Option<MonthlyRecord>> {
        self.check()?;
        self.inner.get_monthly(stream, month).await
    }

    async fn put_monthly(&self, record: &MonthlyRecord) -> Result<()> {
        self.put_monthly_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put_monthly(record).await
    }

    async fn sum_daily_net_for_month(&self, month: YearMonth) -> Result<Vec<MonthlyTotal>> {
        self.check()?;
        self.inner.sum_daily_net_for_month(month).await
    }

    async fn latest_daily_date(&self) -> Result<Option<NaiveDate>> {
        self.check()?;
        self.inner.latest_daily_date().await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.flush().await
    }
}

/// Port used by most contract tests
pub const PORT: Port = Port(12450);

pub fn rule(name: &str) -> Rule {
    name.parse().expect("valid rule")
}

pub fn stream(name: &str) -> StreamKey {
    StreamKey::new(PORT, rule(name))
}

pub fn date(s: &str) -> NaiveDate {
    s.parse().expect("valid date")
}

pub fn month(s: &str) -> YearMonth {
    s.parse().expect("valid month")
}

/// A local wall-clock instant
pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("unambiguous local time")
}

/// One port, one rule, fast retries; enough to observe a single stream
pub fn single_stream_config() -> MeterConfig {
    let mut config = MeterConfig::new()
        .with_port(PORT, "user1")
        .with_rules(vec![rule("input_tcp")]);
    config.engine.max_store_retries = 2;
    config.engine.store_retry_delay_ms = 1;
    config.engine.read_timeout_secs = 1;
    config
}

/// Two ports with every rule
pub fn two_port_config() -> MeterConfig {
    let mut config = MeterConfig::new()
        .with_port(PORT, "user1")
        .with_port(Port(23333), "user2");
    config.engine.max_store_retries = 0;
    config.engine.store_retry_delay_ms = 1;
    config.engine.read_timeout_secs = 1;
    config
}
