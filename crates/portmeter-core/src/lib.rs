// # portmeter-core
//
// Core library for the portmeter traffic accounting system.
//
// ## Architecture Overview
//
// This library turns a stream of raw, possibly-resetting byte counters into
// a monotone daily history and per-month totals:
// - **CounterSource**: Trait for reading cumulative byte counters per (port, rule)
// - **RecordStore**: Trait for durable daily/monthly record storage
// - **reconcile**: Rollover-safe delta computation between two raw readings
// - **DailyTracker**: Per-(port, rule, day) record lifecycle
// - **MonthlyAggregator**: Idempotent month-end rollup of daily records
// - **MeterEngine**: Fixed-interval poll loop tying the pieces together
// - **SourceRegistry**: Name-based registry for counter source and store factories
//
// ## Design Principles
//
// 1. **Stateless restarts**: All durable state lives in the RecordStore
// 2. **Idempotency**: Day initialization and month aggregation can be re-run safely
// 3. **Plugin-Based**: Counter sources and stores are selected by name, not if-else
// 4. **Library-First**: All core functionality can be used as a library

pub mod traits;
pub mod model;
pub mod engine;
pub mod registry;
pub mod config;
pub mod error;
pub mod state;
pub mod util;

// Re-export core types for convenience
pub use traits::{CounterSource, RecordStore};
pub use model::{DailyRecord, Direction, MonthlyRecord, MonthlyTotal, Port, Protocol, Rule, StreamKey, YearMonth};
pub use engine::{Calendar, DailyTracker, EngineEvent, MeterEngine, MonthlyAggregator, reconcile};
pub use registry::SourceRegistry;
pub use config::{CounterSourceConfig, EngineConfig, MeterConfig, RecordStoreConfig};
pub use error::{Error, Result};
pub use state::{FileRecordStore, MemoryRecordStore};
