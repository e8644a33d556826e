// # Record Store Implementations
//
// This module provides implementations of the RecordStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;
mod tables;

pub use file::{FileRecordStore, FileRecordStoreFactory};
pub use memory::{MemoryRecordStore, MemoryRecordStoreFactory};
