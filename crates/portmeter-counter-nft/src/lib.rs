// # nftables Counter Source
//
// This crate provides a counter source that reads the byte counters of
// nftables rules with the `nft` command line tool.
//
// ## How counters are found
//
// For a rule `<direction>_<protocol>` on port `P` the source lists the
// chain named after the direction (`input` or `output`) and sums the value
// after every `bytes` token on lines that match:
//
// - input rules: `<protocol> dport P`
// - output rules: `<protocol> sport P`
//
// A chain such as
//
// ```text
// table inet filter {
//     chain input {
//         tcp dport 12450 counter packets 12 bytes 3480
//         udp dport 12450 counter packets 3 bytes 240
//     }
// }
// ```
//
// yields 3480 for `input_tcp` on 12450. Lines with a missing or malformed
// `bytes` value are ignored.
//
// ## Errors
//
// A failure to run `nft`, a non-zero exit status, or a listing with no
// matching line carrying a usable `bytes` value is reported as
// `Error::CounterSource`. The engine then skips the stream for that cycle
// instead of mistaking a missing reading for a counter reset.
//
// ## Platform Support
//
// nftables is Linux-only; on other platforms every read fails at runtime.

use async_trait::async_trait;
use portmeter_core::config::CounterSourceConfig;
use portmeter_core::model::{Direction, Port, Protocol, Rule};
use portmeter_core::traits::{CounterSource, CounterSourceFactory};
use portmeter_core::{Error, Result, SourceRegistry};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

const DEFAULT_BINARY: &str = "nft";

/// Counter source backed by `nft list chain`
#[derive(Debug, Clone)]
pub struct NftCounterSource {
    family: String,
    table: String,
    binary: String,
}

impl NftCounterSource {
    /// Create a source reading chains of `<family> <table>`
    pub fn new(family: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            table: table.into(),
            binary: DEFAULT_BINARY.to_string(),
        }
    }

    /// Use a different `nft` executable
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn list_chain(&self, chain: &str) -> Result<String> {
        debug!(
            "Running {} list chain {} {} {}",
            self.binary, self.family, self.table, chain
        );

        let output = Command::new(&self.binary)
            .args(["list", "chain", &self.family, &self.table, chain])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::counter_source(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::counter_source(format!(
                "{} list chain {} {} {} exited with {}: {}",
                self.binary,
                self.family,
                self.table,
                chain,
                output.status,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::counter_source(format!("nft output is not UTF-8: {}", e)))
    }
}

#[async_trait]
impl CounterSource for NftCounterSource {
    async fn read_counter(&self, port: Port, rule: Rule) -> Result<u64> {
        let listing = self.list_chain(rule.direction.as_str()).await?;
        let bytes = parse_counter(&listing, rule.direction, rule.protocol, port).ok_or_else(|| {
            Error::counter_source(format!(
                "no counter for port {} {} in chain {} of {} {}",
                port,
                rule,
                rule.direction.as_str(),
                self.family,
                self.table
            ))
        })?;
        trace!("nft counter port {} {}: {}", port, rule, bytes);
        Ok(bytes)
    }

    fn source_name(&self) -> &'static str {
        "nft"
    }
}

/// Sum the rule byte counters for `port` in an `nft list chain` listing
///
/// Returns `None` when no matching line carries a usable `bytes` value.
pub fn parse_counter(
    listing: &str,
    direction: Direction,
    protocol: Protocol,
    port: Port,
) -> Option<u64> {
    let selector = match direction {
        Direction::Input => "dport",
        Direction::Output => "sport",
    };
    let pattern = format!("{} {} {}", protocol.as_str(), selector, port);

    listing
        .lines()
        .filter(|line| matches_port(line, &pattern))
        .filter_map(bytes_value)
        .fold(None, |total: Option<u64>, bytes| {
            Some(total.unwrap_or(0).saturating_add(bytes))
        })
}

/// Substring match that does not let port 80 match `dport 8080`
fn matches_port(line: &str, pattern: &str) -> bool {
    line.match_indices(pattern).any(|(start, _)| {
        line[start + pattern.len()..]
            .chars()
            .next()
            .is_none_or(|next| !next.is_ascii_digit())
    })
}

fn bytes_value(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    tokens.find(|token| *token == "bytes")?;
    tokens.next()?.parse().ok()
}

/// Settings accepted through `CounterSourceConfig::Custom { factory: "nft", .. }`
#[derive(Debug, Deserialize)]
struct NftSettings {
    #[serde(default = "default_family")]
    family: String,
    #[serde(default = "default_table")]
    table: String,
    #[serde(default)]
    binary: Option<String>,
}

fn default_family() -> String {
    "inet".to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

/// Factory for creating nftables counter sources
pub struct NftFactory;

impl CounterSourceFactory for NftFactory {
    fn create(&self, config: &CounterSourceConfig) -> Result<Box<dyn CounterSource>> {
        let settings = match config {
            CounterSourceConfig::Nft {
                family,
                table,
                binary,
            } => NftSettings {
                family: family.clone(),
                table: table.clone(),
                binary: binary.clone(),
            },
            CounterSourceConfig::Custom { config, .. } => {
                serde_json::from_value(config.clone())?
            }
        };

        let source = NftCounterSource::new(settings.family, settings.table);
        let source = match settings.binary {
            Some(binary) => source.with_binary(binary),
            None => source,
        };
        Ok(Box::new(source))
    }
}

/// Register the nftables counter source with a registry
pub fn register(registry: &SourceRegistry) {
    registry.register_counter_source("nft", Box::new(NftFactory));
}
