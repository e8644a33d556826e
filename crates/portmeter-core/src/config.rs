//! Configuration types for the portmeter system
//!
//! This module defines all configuration structures used throughout the crate.
//! Configuration is loaded once at startup, validated, and handed to the
//! engine by value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Port, Rule, StreamKey};

/// Main portmeter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Monitored ports and their human-readable labels
    pub ports: BTreeMap<Port, String>,

    /// Rules evaluated against every port each cycle
    #[serde(default = "Rule::all")]
    pub rules: Vec<Rule>,

    /// Counter source configuration
    #[serde(default)]
    pub counter_source: CounterSourceConfig,

    /// Record store configuration
    #[serde(default)]
    pub record_store: RecordStoreConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl MeterConfig {
    /// Create a new configuration with defaults and no ports
    pub fn new() -> Self {
        Self {
            ports: BTreeMap::new(),
            rules: Rule::all(),
            counter_source: CounterSourceConfig::default(),
            record_store: RecordStoreConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Add a monitored port
    pub fn with_port(mut self, port: Port, label: impl Into<String>) -> Self {
        self.ports.insert(port, label.into());
        self
    }

    /// Replace the rule list
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    /// Every monitored (port, rule) stream, ports ascending, rules in configured order
    pub fn streams(&self) -> Vec<StreamKey> {
        self.ports
            .keys()
            .flat_map(|port| self.rules.iter().map(|rule| StreamKey::new(*port, *rule)))
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ports.is_empty() {
            return Err(crate::Error::config("No ports configured"));
        }

        for (port, label) in &self.ports {
            if port.0 == 0 {
                return Err(crate::Error::config("Port 0 cannot be monitored"));
            }
            if label.trim().is_empty() {
                return Err(crate::Error::config(format!("Port {} has an empty label", port)));
            }
        }

        if self.rules.is_empty() {
            return Err(crate::Error::config("No rules configured"));
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if self.rules[..i].contains(rule) {
                return Err(crate::Error::config(format!("Duplicate rule: {}", rule)));
            }
        }

        self.counter_source.validate()?;
        self.record_store.validate()?;
        self.engine.validate()?;

        Ok(())
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// nftables address families accepted by `nft list chain`
const NFT_FAMILIES: &[&str] = &["ip", "ip6", "inet", "arp", "bridge", "netdev"];

/// Counter source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterSourceConfig {
    /// nftables rule counters read via the `nft` tool
    Nft {
        /// Table family (e.g. "inet")
        #[serde(default = "default_nft_family")]
        family: String,
        /// Table name (e.g. "filter")
        #[serde(default = "default_nft_table")]
        table: String,
        /// Path to the `nft` binary, `nft` from PATH when absent
        #[serde(default)]
        binary: Option<String>,
    },

    /// Custom counter source
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl CounterSourceConfig {
    /// Validate the counter source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            CounterSourceConfig::Nft { family, table, binary } => {
                if !NFT_FAMILIES.contains(&family.as_str()) {
                    return Err(crate::Error::config(format!(
                        "Unknown nftables family '{}'. Supported: {}",
                        family,
                        NFT_FAMILIES.join(", ")
                    )));
                }
                if table.is_empty() {
                    return Err(crate::Error::config("nftables table cannot be empty"));
                }
                if binary.as_ref().is_some_and(|b| b.is_empty()) {
                    return Err(crate::Error::config("nft binary path cannot be empty"));
                }
                Ok(())
            }
            CounterSourceConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom counter source factory cannot be empty",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the counter source type name
    pub fn type_name(&self) -> &str {
        match self {
            CounterSourceConfig::Nft { .. } => "nft",
            CounterSourceConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for CounterSourceConfig {
    fn default() -> Self {
        CounterSourceConfig::Nft {
            family: default_nft_family(),
            table: default_nft_table(),
            binary: None,
        }
    }
}

fn default_nft_family() -> String {
    "inet".to_string()
}

fn default_nft_table() -> String {
    "filter".to_string()
}

/// Record store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordStoreConfig {
    /// JSON file store
    File {
        /// Path to the records file
        path: String,
    },

    /// SQLite database
    Sqlite {
        /// Path to the database file
        path: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// Custom record store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl RecordStoreConfig {
    /// Validate the record store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            RecordStoreConfig::File { path } | RecordStoreConfig::Sqlite { path } => {
                if path.is_empty() {
                    return Err(crate::Error::config(format!(
                        "{} record store path cannot be empty",
                        self.type_name()
                    )));
                }
                Ok(())
            }
            RecordStoreConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom record store factory cannot be empty",
                    ));
                }
                Ok(())
            }
            RecordStoreConfig::Memory => Ok(()),
        }
    }

    /// Get the record store type name
    pub fn type_name(&self) -> &str {
        match self {
            RecordStoreConfig::File { .. } => "file",
            RecordStoreConfig::Sqlite { .. } => "sqlite",
            RecordStoreConfig::Memory => "memory",
            RecordStoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on a single counter read (in seconds)
    ///
    /// A read that exceeds it is treated as a failed read for that cycle,
    /// so one stuck counter cannot stall every other stream.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Retry attempts for a failed store operation before it is surfaced
    #[serde(default = "default_max_store_retries")]
    pub max_store_retries: usize,

    /// Delay between store retry attempts (in milliseconds)
    #[serde(default = "default_store_retry_delay_ms")]
    pub store_retry_delay_ms: u64,

    /// Capacity of the engine event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl EngineConfig {
    /// Validate the engine settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.poll_interval_secs == 0 {
            return Err(crate::Error::config("Poll interval must be > 0"));
        }
        if self.read_timeout_secs == 0 {
            return Err(crate::Error::config("Counter read timeout must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_store_retries: default_max_store_retries(),
            store_retry_delay_ms: default_store_retry_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_read_timeout_secs() -> u64 {
    10
}

fn default_max_store_retries() -> usize {
    3
}

fn default_store_retry_delay_ms() -> u64 {
    500
}

fn default_event_channel_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_port_config() -> MeterConfig {
        MeterConfig::new()
            .with_port(Port(12450), "user1")
            .with_port(Port(23333), "user2")
    }

    #[test]
    fn test_streams_cover_every_port_and_rule() {
        let config = two_port_config();
        let streams = config.streams();

        assert_eq!(streams.len(), 8);
        assert_eq!(streams[0].port, Port(12450));
        assert_eq!(streams[0].rule.to_string(), "input_tcp");
        assert_eq!(streams[7].port, Port(23333));
        assert_eq!(streams[7].rule.to_string(), "output_udp");
        assert_eq!(config.ports.get(&Port(23333)).map(String::as_str), Some("user2"));
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicate_settings() {
        assert!(MeterConfig::new().validate().is_err());
        assert!(two_port_config().validate().is_ok());

        let no_rules = two_port_config().with_rules(Vec::new());
        assert!(no_rules.validate().is_err());

        let rule: Rule = "input_tcp".parse().unwrap();
        let duplicated = two_port_config().with_rules(vec![rule, rule]);
        assert!(duplicated.validate().is_err());

        let mut zero_interval = two_port_config();
        zero_interval.engine.poll_interval_secs = 0;
        assert!(zero_interval.validate().is_err());

        let mut bad_family = two_port_config();
        bad_family.counter_source = CounterSourceConfig::Nft {
            family: "inet6".to_string(),
            table: "filter".to_string(),
            binary: None,
        };
        assert!(bad_family.validate().is_err());

        let mut empty_path = two_port_config();
        empty_path.record_store = RecordStoreConfig::Sqlite { path: String::new() };
        assert!(empty_path.validate().is_err());
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let config: MeterConfig = serde_json::from_str(
            r#"{
                "ports": { "12450": "user1" },
                "record_store": { "type": "file", "path": "/tmp/records.json" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.rules, Rule::all());
        assert_eq!(config.engine.poll_interval_secs, 60);
        assert_eq!(config.counter_source.type_name(), "nft");
        assert_eq!(config.record_store.type_name(), "file");
        assert!(config.validate().is_ok());
    }
}
