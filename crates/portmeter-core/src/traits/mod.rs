//! Core traits for the portmeter system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`CounterSource`]: Read cumulative byte counters
//! - [`RecordStore`]: Durable storage for daily and monthly records

pub mod counter_source;
pub mod record_store;

pub use counter_source::{CounterSource, CounterSourceFactory};
pub use record_store::{RecordStore, RecordStoreFactory};
