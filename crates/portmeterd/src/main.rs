// # portmeterd - Port Traffic Meter Daemon
//
// This is a thin integration layer: all reconciliation and rollup logic
// lives in portmeter-core. Configuration is via environment variables only.
//
// The portmeterd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering counter sources and record stores
// 4. Running the meter engine until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Monitored ports
// - `PORTMETER_PORTS`: Comma-separated `port=label` pairs (required),
//   e.g. `12450=user1,23333=user2`
// - `PORTMETER_RULES`: Comma-separated rules (default: `input_tcp,input_udp,output_tcp,output_udp`)
//
// ### Counter source
// - `PORTMETER_COUNTER_SOURCE`: Counter source type (default: `nft`)
// - `PORTMETER_NFT_FAMILY`: nftables family (default: `inet`)
// - `PORTMETER_NFT_TABLE`: nftables table (default: `filter`)
//
// ### Record store
// - `PORTMETER_STORE_TYPE`: Type of record store (sqlite, file, memory; default: sqlite)
// - `PORTMETER_STORE_PATH`: Database or state file path (default: `traffic_history.db`)
//
// ### Engine
// - `PORTMETER_POLL_INTERVAL_SECS`: Seconds between poll cycles (10-3600, default 60)
// - `PORTMETER_READ_TIMEOUT_SECS`: Counter read timeout (1-300, default 10)
// - `PORTMETER_MAX_STORE_RETRIES`: Store retry attempts (0-10, default 3)
// - `PORTMETER_STORE_RETRY_DELAY_MS`: Delay between store retries (default 500)
// - `PORTMETER_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```bash
// export PORTMETER_PORTS=12450=user1,23333=user2
// export PORTMETER_STORE_PATH=/var/lib/portmeter/traffic_history.db
//
// portmeterd
// ```

use anyhow::{Context, Result};
use portmeter_core::{
    CounterSourceConfig, EngineConfig, EngineEvent, MeterConfig, MeterEngine, Port,
    RecordStoreConfig, Rule, SourceRegistry,
};
use std::collections::BTreeMap;
use std::env;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Time the engine gets to flush after its last tick, on top of the tick itself
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum MeterExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<MeterExitCode> for ExitCode {
    fn from(code: MeterExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    ports: BTreeMap<Port, String>,
    rules: Vec<Rule>,
    counter_source: String,
    nft_family: String,
    nft_table: String,
    store_type: String,
    store_path: String,
    poll_interval_secs: u64,
    read_timeout_secs: u64,
    max_store_retries: usize,
    store_retry_delay_ms: u64,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let defaults = EngineConfig::default();

        Ok(Self {
            ports: parse_ports(&lookup("PORTMETER_PORTS").unwrap_or_default())?,
            rules: match lookup("PORTMETER_RULES") {
                Some(rules) => parse_rules(&rules)?,
                None => Rule::all(),
            },
            counter_source: var("PORTMETER_COUNTER_SOURCE", "nft"),
            nft_family: var("PORTMETER_NFT_FAMILY", "inet"),
            nft_table: var("PORTMETER_NFT_TABLE", "filter"),
            store_type: var("PORTMETER_STORE_TYPE", "sqlite"),
            store_path: var("PORTMETER_STORE_PATH", "traffic_history.db"),
            poll_interval_secs: parse_number(
                &lookup,
                "PORTMETER_POLL_INTERVAL_SECS",
                defaults.poll_interval_secs,
            )?,
            read_timeout_secs: parse_number(
                &lookup,
                "PORTMETER_READ_TIMEOUT_SECS",
                defaults.read_timeout_secs,
            )?,
            max_store_retries: parse_number(
                &lookup,
                "PORTMETER_MAX_STORE_RETRIES",
                defaults.max_store_retries,
            )?,
            store_retry_delay_ms: parse_number(
                &lookup,
                "PORTMETER_STORE_RETRY_DELAY_MS",
                defaults.store_retry_delay_ms,
            )?,
            log_level: var("PORTMETER_LOG_LEVEL", "info"),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            anyhow::bail!(
                "PORTMETER_PORTS must contain at least one port. \
                Set it via: export PORTMETER_PORTS=12450=user1,23333=user2"
            );
        }

        match self.counter_source.as_str() {
            "nft" => {}
            _ => anyhow::bail!(
                "PORTMETER_COUNTER_SOURCE '{}' is not supported. \
                Supported sources: nft",
                self.counter_source
            ),
        }

        match self.store_type.as_str() {
            "sqlite" | "file" | "memory" => {}
            _ => anyhow::bail!(
                "PORTMETER_STORE_TYPE '{}' is not supported. \
                Supported types: sqlite, file, memory",
                self.store_type
            ),
        }

        if self.store_type != "memory" {
            if self.store_path.is_empty() {
                anyhow::bail!(
                    "PORTMETER_STORE_PATH cannot be empty when PORTMETER_STORE_TYPE={}",
                    self.store_type
                );
            }

            if let Some(parent) = std::path::Path::new(&self.store_path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "PORTMETER_STORE_PATH parent directory does not exist: {}. \
                        Create it first: sudo mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        if !(10..=3600).contains(&self.poll_interval_secs) {
            anyhow::bail!(
                "PORTMETER_POLL_INTERVAL_SECS must be between 10 and 3600 seconds. Got: {}",
                self.poll_interval_secs
            );
        }

        if !(1..=300).contains(&self.read_timeout_secs) {
            anyhow::bail!(
                "PORTMETER_READ_TIMEOUT_SECS must be between 1 and 300 seconds. Got: {}",
                self.read_timeout_secs
            );
        }

        if self.max_store_retries > 10 {
            anyhow::bail!(
                "PORTMETER_MAX_STORE_RETRIES must be between 0 and 10. Got: {}",
                self.max_store_retries
            );
        }

        if self.store_retry_delay_ms > 60_000 {
            anyhow::bail!(
                "PORTMETER_STORE_RETRY_DELAY_MS must be at most 60000. Got: {}",
                self.store_retry_delay_ms
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "PORTMETER_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Upper bound on the time a signal waits for the engine to stop
    ///
    /// A tick on a new date reads every stream twice (day start, then poll),
    /// and each read is followed by store writes that may be retried.
    fn shutdown_grace(&self) -> Duration {
        let streams = (self.ports.len() * self.rules.len()) as u64;
        let retry_budget_ms = self.max_store_retries as u64 * self.store_retry_delay_ms;
        let per_stream_ms = self.read_timeout_secs * 1000 + 2 * retry_budget_ms;
        Duration::from_millis(2 * streams * per_stream_ms) + SHUTDOWN_FLUSH_GRACE
    }

    /// Build the library configuration
    fn meter_config(&self) -> MeterConfig {
        let record_store = match self.store_type.as_str() {
            "file" => RecordStoreConfig::File {
                path: self.store_path.clone(),
            },
            "memory" => RecordStoreConfig::Memory,
            _ => RecordStoreConfig::Sqlite {
                path: self.store_path.clone(),
            },
        };

        MeterConfig {
            ports: self.ports.clone(),
            rules: self.rules.clone(),
            counter_source: CounterSourceConfig::Nft {
                family: self.nft_family.clone(),
                table: self.nft_table.clone(),
                binary: None,
            },
            record_store,
            engine: EngineConfig {
                poll_interval_secs: self.poll_interval_secs,
                read_timeout_secs: self.read_timeout_secs,
                max_store_retries: self.max_store_retries,
                store_retry_delay_ms: self.store_retry_delay_ms,
                ..EngineConfig::default()
            },
        }
    }
}

/// Parse `12450=user1,23333=user2`
fn parse_ports(value: &str) -> Result<BTreeMap<Port, String>> {
    let mut ports = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (port, label) = entry
            .split_once('=')
            .with_context(|| format!("PORTMETER_PORTS entry '{}' is not port=label", entry))?;
        let port: Port = port
            .trim()
            .parse()
            .with_context(|| format!("PORTMETER_PORTS entry '{}' has an invalid port", entry))?;
        let label = label.trim();
        if label.is_empty() {
            anyhow::bail!("PORTMETER_PORTS entry '{}' has an empty label", entry);
        }
        if ports.insert(port, label.to_string()).is_some() {
            anyhow::bail!("PORTMETER_PORTS lists port {} twice", port);
        }
    }
    Ok(ports)
}

/// Parse `input_tcp,output_tcp`
fn parse_rules(value: &str) -> Result<Vec<Rule>> {
    let mut rules: Vec<Rule> = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let rule: Rule = name
            .parse()
            .with_context(|| format!("PORTMETER_RULES entry '{}' is not a valid rule", name))?;
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    if rules.is_empty() {
        anyhow::bail!("PORTMETER_RULES must contain at least one rule");
    }
    Ok(rules)
}

fn parse_number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number. Got: '{}'", key, value)),
        None => Ok(default),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return MeterExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return MeterExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return MeterExitCode::ConfigError.into();
    }

    info!("Starting portmeterd daemon");
    info!(
        "Configuration loaded: {} port(s), {} rule(s)",
        config.ports.len(),
        config.rules.len()
    );

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return MeterExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> MeterExitCode {
    let registry = SourceRegistry::with_builtin_stores();

    #[cfg(feature = "nft")]
    {
        info!("Registering nftables counter source");
        portmeter_counter_nft::register(&registry);
    }

    #[cfg(feature = "sqlite")]
    {
        info!("Registering SQLite record store");
        portmeter_store_sqlite::register(&registry);
    }

    let engine = match build_engine(&registry, &config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return MeterExitCode::ConfigError;
        }
    };

    match serve(engine, config.shutdown_grace()).await {
        Ok(()) => MeterExitCode::CleanShutdown,
        Err(e) => {
            error!("Daemon error: {:#}", e);
            MeterExitCode::RuntimeError
        }
    }
}

/// Create the counter source, record store and engine from configuration
async fn build_engine(
    registry: &SourceRegistry,
    config: &Config,
) -> Result<(MeterEngine, tokio::sync::mpsc::Receiver<EngineEvent>)> {
    let meter_config = config.meter_config();

    for (port, label) in &meter_config.ports {
        info!("Monitoring port {} ({})", port, label);
    }
    info!("Counter source: {}", meter_config.counter_source.type_name());
    info!("Record store: {}", meter_config.record_store.type_name());

    let source = registry
        .create_counter_source(&meter_config.counter_source)
        .context("Failed to create counter source")?;
    let store = registry
        .create_record_store(&meter_config.record_store)
        .await
        .context("Failed to open record store")?;

    Ok(MeterEngine::new(source, store, meter_config)?)
}

/// Run the engine until a shutdown signal, then wait for it to flush
async fn serve(
    (engine, mut events): (MeterEngine, tokio::sync::mpsc::Receiver<EngineEvent>),
    grace: Duration,
) -> Result<()> {
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut engine_task =
        tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    info!("Engine started");

    let stopped_early = tokio::select! {
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
            None
        }

        joined = &mut engine_task => Some(joined),
    };

    let result = match stopped_early {
        Some(joined) => match joined.context("Engine task panicked")? {
            Ok(()) => Err(anyhow::anyhow!("Engine stopped without a shutdown signal")),
            Err(e) => Err(anyhow::Error::from(e).context("Engine stopped")),
        },
        None => {
            let _ = shutdown_tx.send(());
            debug!("Waiting up to {:?} for the engine to stop", grace);
            match tokio::time::timeout(grace, &mut engine_task).await {
                Ok(joined) => joined
                    .context("Engine task panicked")?
                    .map_err(anyhow::Error::from),
                Err(_) => {
                    engine_task.abort();
                    Err(anyhow::anyhow!("Shutdown timeout after {:?}", grace))
                }
            }
        }
    };

    // The event channel closes once the engine is dropped
    if let Err(e) = event_task.await {
        warn!("Event logger task failed: {}", e);
    }

    if result.is_ok() {
        info!("Shutting down daemon");
    }
    result
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Started { streams_count } => {
            info!("Engine polling {} stream(s)", streams_count)
        }
        EngineEvent::DayStarted {
            date,
            created,
            already_present,
            skipped,
        } => info!(
            "Day {} started: {} created, {} already present, {} skipped",
            date, created, already_present, skipped
        ),
        EngineEvent::MonthAggregated { month, streams } => {
            info!("Month {} aggregated for {} stream(s)", month, streams)
        }
        EngineEvent::TickFailed { error } => warn!("Poll cycle failed: {}", error),
        EngineEvent::Stopped { reason } => info!("Engine stopped: {}", reason),
        other => debug!("Engine event: {:?}", other),
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
