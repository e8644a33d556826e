// # Counter Source Trait
//
// Defines the interface for reading raw cumulative byte counters.
//
// ## Implementations
//
// - nftables rule counters: `portmeter-counter-nft` crate
// - Future: iptables, eBPF maps, SNMP interface counters
//
// ## Usage
//
// ```rust,ignore
// use portmeter_core::{CounterSource, Port, Rule};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let source = /* CounterSource implementation */;
//
//     let bytes = source.read_counter(Port(12450), "input_tcp".parse()?).await?;
//     println!("{} bytes so far", bytes);
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::model::{Port, Rule};

/// Trait for counter source implementations
///
/// A counter source reports, at call time, the cumulative number of bytes
/// matched for a (port, rule) pair. Readings are expected to be monotone
/// non-decreasing until the underlying counter is reset, after which they
/// may restart near zero. Reset handling is owned by the engine.
///
/// # Failure Semantics
///
/// When no reading is available the source must return an error, never `0`.
/// A spurious zero is indistinguishable from a counter reset and would be
/// reconciled as one.
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Spawn external processes or read kernel interfaces to obtain counters
/// - ✅ Parse tool-specific output
///
/// ## Forbidden Capabilities
/// - ❌ Access the record store (owned by `MeterEngine`)
/// - ❌ Implement retry or timeout logic (owned by `MeterEngine`)
/// - ❌ Cache readings between calls
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Read the current cumulative byte count for `port` under `rule`
    ///
    /// # Returns
    ///
    /// - `Ok(u64)`: The cumulative byte count
    /// - `Err(Error)`: If the counter could not be read
    async fn read_counter(&self, port: Port, rule: Rule) -> Result<u64, crate::Error>;

    /// Get the source name (for logging/debugging)
    fn source_name(&self) -> &'static str;
}

/// Helper trait for constructing counter sources from configuration
pub trait CounterSourceFactory: Send + Sync {
    /// Create a CounterSource instance from configuration
    fn create(
        &self,
        config: &crate::config::CounterSourceConfig,
    ) -> Result<Box<dyn CounterSource>, crate::Error>;
}
