//! Architectural Contract Test: Counter Reconciliation
//!
//! This test verifies that raw counter readings are folded into daily
//! totals correctly across growth, resets and failed reads.
//!
//! Constraints verified:
//! - The first reading of a day anchors the record without counting traffic
//! - A reading below the previous one is treated as a counter reset
//! - A failed read leaves the stored record untouched
//! - Streams are reconciled independently of each other
//!
//! If this test fails, daily traffic figures are wrong.

mod common;

use common::*;
use portmeter_core::engine::{Calendar, EngineEvent};
use portmeter_core::model::YearMonth;
use portmeter_core::MeterEngine;

fn engine_for(source: &ScriptedCounterSource, store: &ObservedStore) -> (MeterEngine, tokio::sync::mpsc::Receiver<EngineEvent>) {
    MeterEngine::new(
        Box::new(source.clone()),
        Box::new(store.clone()),
        single_stream_config(),
    )
    .expect("engine construction succeeds")
}

fn fresh_calendar() -> Calendar {
    Calendar {
        date: None,
        month: month("2024-05"),
    }
}

#[tokio::test]
async fn growth_within_a_day_is_counted_from_the_anchor() {
    let source = ScriptedCounterSource::new();
    let store = ObservedStore::new();
    let (engine, _events) = engine_for(&source, &store);
    let mut calendar = fresh_calendar();

    source.set(stream("input_tcp"), 1000);
    let summary = engine
        .tick_at(&mut calendar, at(2024, 5, 1, 0, 5))
        .await
        .expect("tick succeeds");
    assert_eq!(summary.initialized, 1);

    let anchored = store.daily(stream("input_tcp"), date("2024-05-01")).await.unwrap();
    assert_eq!((anchored.base, anchored.accumulated, anchored.last_raw), (1000, 1000, 1000));

    source.set(stream("input_tcp"), 1500);
    engine
        .tick_at(&mut calendar, at(2024, 5, 1, 0, 6))
        .await
        .expect("tick succeeds");

    let record = store.daily(stream("input_tcp"), date("2024-05-01")).await.unwrap();
    assert_eq!(record.base, 1000);
    assert_eq!(record.accumulated, 1500);
    assert_eq!(record.last_raw, 1500);
    assert_eq!(record.net(), 500);
}

#[tokio::test]
async fn counter_reset_counts_the_new_reading_as_delta() {
    let source = ScriptedCounterSource::new();
    let store = ObservedStore::new();
    let (engine, mut events) = engine_for(&source, &store);
    let mut calendar = fresh_calendar();

    for (minute, raw) in [(5, 1000), (6, 1500), (7, 200)] {
        source.set(stream("input_tcp"), raw);
        engine
            .tick_at(&mut calendar, at(2024, 5, 1, 0, minute))
            .await
            .expect("tick succeeds");
    }

    let record = store.daily(stream("input_tcp"), date("2024-05-01")).await.unwrap();
    assert_eq!(record.accumulated, 1700);
    assert_eq!(record.last_raw, 200);
    assert_eq!(record.net(), 700);

    let mut resets = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::CounterReset { last_raw, new_raw, .. } = event {
            resets.push((last_raw, new_raw));
        }
    }
    assert_eq!(resets, vec![(1500, 200)]);
}

#[tokio::test]
async fn failed_read_skips_the_stream_without_touching_the_record() {
    let source = ScriptedCounterSource::new();
    let store = ObservedStore::new();
    let (engine, mut events) = engine_for(&source, &store);
    let mut calendar = fresh_calendar();

    source.set(stream("input_tcp"), 1000);
    engine.tick_at(&mut calendar, at(2024, 5, 1, 0, 5)).await.unwrap();
    source.set(stream("input_tcp"), 1500);
    engine.tick_at(&mut calendar, at(2024, 5, 1, 0, 6)).await.unwrap();
    let before = store.daily(stream("input_tcp"), date("2024-05-01")).await;

    source.fail(stream("input_tcp"));
    let summary = engine
        .tick_at(&mut calendar, at(2024, 5, 1, 0, 7))
        .await
        .expect("a failed read does not fail the tick");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(store.daily(stream("input_tcp"), date("2024-05-01")).await, before);

    let failures = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::CounterReadFailed { .. }))
        .count();
    assert_eq!(failures, 1);

    source.recover(stream("input_tcp"));
    source.set(stream("input_tcp"), 1800);
    engine.tick_at(&mut calendar, at(2024, 5, 1, 0, 8)).await.unwrap();

    let record = store.daily(stream("input_tcp"), date("2024-05-01")).await.unwrap();
    assert_eq!(record.net(), 800);
}

#[tokio::test]
async fn streams_are_reconciled_independently() {
    let source = ScriptedCounterSource::new();
    let store = ObservedStore::new();
    let (engine, _events) = MeterEngine::new(
        Box::new(source.clone()),
        Box::new(store.clone()),
        two_port_config(),
    )
    .expect("engine construction succeeds");
    assert_eq!(engine.streams().len(), 8);

    let streams = engine.streams().to_vec();
    source.set_all(&streams, 100);
    let mut calendar = fresh_calendar();
    let summary = engine.tick_at(&mut calendar, at(2024, 5, 1, 9, 0)).await.unwrap();
    assert_eq!(summary.initialized, 8);

    // One stream grows, one resets, one fails; the rest stay flat
    source.set(streams[0], 400);
    source.set(streams[1], 30);
    source.fail(streams[2]);
    let summary = engine.tick_at(&mut calendar, at(2024, 5, 1, 9, 1)).await.unwrap();
    assert_eq!(summary.updated, 7);
    assert_eq!(summary.resets, 1);
    assert_eq!(summary.skipped, 1);

    let day = date("2024-05-01");
    let net = |record: Option<portmeter_core::model::DailyRecord>| record.map(|r| r.net());
    assert_eq!(net(store.daily(streams[0], day).await), Some(300));
    assert_eq!(net(store.daily(streams[1], day).await), Some(30));
    assert_eq!(net(store.daily(streams[2], day).await), Some(0));
    for other in &streams[3..] {
        assert_eq!(net(store.daily(*other, day).await), Some(0));
    }

    assert_eq!(calendar.month, YearMonth::new(2024, 5).unwrap());
}
