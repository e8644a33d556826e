//! Minimal embedding example for portmeter-core
//!
//! This example demonstrates using portmeter-core as a library in a custom
//! application with its own counter source. It first replays a simulated
//! month boundary with `tick_at`, then runs the engine on a real timer and
//! stops it through a shutdown channel.

use chrono::{Local, TimeZone};
use portmeter_core::engine::Calendar;
use portmeter_core::traits::{CounterSource, RecordStore};
use portmeter_core::util::format_bytes;
use portmeter_core::{
    EngineConfig, MemoryRecordStore, MeterConfig, MeterEngine, Port, Result, Rule, StreamKey,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counter source fed by the application
///
/// Each stream starts at zero; `traffic` adds bytes and `reset` simulates a
/// firewall reload that zeroes every counter.
#[derive(Clone, Default)]
struct EmbeddedCounters {
    counters: Arc<Mutex<HashMap<StreamKey, u64>>>,
    reads: Arc<AtomicU64>,
}

impl EmbeddedCounters {
    fn traffic(&self, stream: StreamKey, bytes: u64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(stream).or_default() += bytes;
    }

    fn reset(&self) {
        self.counters.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl CounterSource for EmbeddedCounters {
    async fn read_counter(&self, port: Port, rule: Rule) -> Result<u64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let counters = self.counters.lock().unwrap();
        Ok(counters
            .get(&StreamKey::new(port, rule))
            .copied()
            .unwrap_or(0))
    }

    fn source_name(&self) -> &'static str {
        "embedded"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("=== Embedded portmeter-core Example ===\n");

    let counters = EmbeddedCounters::default();
    let store = MemoryRecordStore::new();

    let config = MeterConfig {
        engine: EngineConfig {
            poll_interval_secs: 1,
            max_store_retries: 0,
            event_channel_capacity: 100,
            ..EngineConfig::default()
        },
        ..MeterConfig::new().with_port(Port(12450), "user1")
    };
    let web: StreamKey = StreamKey::new(Port(12450), "input_tcp".parse()?);

    println!("1. Creating engine...");
    let (engine, mut event_rx) =
        MeterEngine::new(Box::new(counters.clone()), Box::new(store.clone()), config)?;

    // Replay the last two days of May and the first of June
    println!("2. Replaying a month boundary with explicit timestamps");
    let mut calendar = Calendar {
        date: None,
        month: "2024-05".parse()?,
    };
    let timeline = [
        ((2024, 5, 30, 9), 0),
        ((2024, 5, 30, 18), 300),
        ((2024, 5, 31, 9), 500),
        ((2024, 5, 31, 18), 400),
        ((2024, 6, 1, 9), 0),
    ];
    for ((year, month, day, hour), bytes) in timeline {
        // Firewall reload in the afternoon of the 31st
        if (day, hour) == (31, 18) {
            counters.reset();
        }
        counters.traffic(web, bytes);

        let now = Local
            .with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .ok_or_else(|| portmeter_core::Error::invalid_input("ambiguous local time"))?;
        let summary = engine.tick_at(&mut calendar, now).await?;
        println!("   {} -> {:?}", now.format("%Y-%m-%d %H:%M"), summary);
    }

    let may_total = engine
        .aggregator()
        .monthly_total(web, "2024-05".parse()?)
        .await?
        .unwrap_or(0);
    println!("   May total for {}: {}\n", web, format_bytes(may_total));

    while let Ok(event) = event_rx.try_recv() {
        println!("[Event] {:?}", event);
    }

    // Run on the real clock for a couple of cycles
    println!("\n3. Starting engine in background...");
    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
        println!("Event listener stopped");
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let engine_handle =
        tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    for _ in 0..2 {
        counters.traffic(web, 4096);
        tokio::time::sleep(tokio::time::Duration::from_millis(1100)).await;
    }

    println!("4. Stopping engine...");
    let _ = shutdown_tx.send(());
    if let Ok(Err(e)) = engine_handle.await {
        eprintln!("Engine stopped with error: {}", e);
    }
    let _ = event_listener.await;

    let today = Local::now().date_naive();
    if let Some(record) = store.get_daily(web, today).await? {
        println!(
            "\n5. Today's {} total: {}",
            web,
            format_bytes(record.net())
        );
    }
    println!(
        "   {} counter reads, {} daily record(s) in memory",
        counters.reads.load(Ordering::SeqCst),
        store.daily_len().await
    );

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- The application supplies its own counter source");
    println!("- tick_at makes day and month rollover deterministic");
    println!("- Shutdown is driven by the application, and records are flushed");

    Ok(())
}
