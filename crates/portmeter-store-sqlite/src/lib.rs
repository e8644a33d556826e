// # SQLite Record Store
//
// This crate persists daily and monthly traffic records in a SQLite
// database with two tables:
//
// ```text
// traffic_daily   (port, rule, report_date,  base, accumulated, last_raw, last_update)
// traffic_monthly (port, rule, report_month, total, last_update)
// ```
//
// Dates are stored as `YYYY-MM-DD`, months as `YYYY-MM`, rules in their
// textual form (`input_tcp`) and `last_update` as an RFC 3339 UTC timestamp.
// Both tables are written with `INSERT .. ON CONFLICT DO UPDATE`, so every
// write replaces the whole row in one statement.
//
// ## Threading
//
// rusqlite is blocking. The connection sits behind a mutex and every
// operation runs on the blocking thread pool via `spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use portmeter_core::config::RecordStoreConfig;
use portmeter_core::model::{
    DailyRecord, MonthlyRecord, MonthlyTotal, Port, Rule, StreamKey, YearMonth,
};
use portmeter_core::traits::{RecordStore, RecordStoreFactory};
use portmeter_core::{Error, Result, SourceRegistry};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_daily (
    port INTEGER,
    rule TEXT,
    report_date TEXT,
    base INTEGER,
    accumulated INTEGER,
    last_raw INTEGER,
    last_update TEXT,
    PRIMARY KEY (port, rule, report_date)
);

CREATE TABLE IF NOT EXISTS traffic_monthly (
    port INTEGER,
    rule TEXT,
    report_month TEXT,
    total INTEGER,
    last_update TEXT,
    PRIMARY KEY (port, rule, report_month)
);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path` and make sure both tables exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::record_store(format!("open task failed: {}", e)))?
        .map_err(|e| Error::record_store(format!("failed to open {}: {}", path.display(), e)))?;

        info!("Opened traffic database {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// An in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .and_then(|conn| conn.execute_batch(SCHEMA).map(|()| conn))
            .map_err(|e| Error::record_store(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file path (`None` for in-memory databases)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `op` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&guard)
        })
        .await
        .map_err(|e| Error::record_store(format!("{} task failed: {}", what, e)))?
        .map_err(|e| Error::record_store(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_daily(&self, stream: StreamKey, date: NaiveDate) -> Result<Option<DailyRecord>> {
        self.with_conn("get_daily", move |conn| {
            conn.query_row(
                "SELECT port, rule, report_date, base, accumulated, last_raw, last_update
                 FROM traffic_daily
                 WHERE port = ?1 AND rule = ?2 AND report_date = ?3",
                params![
                    stream.port.0,
                    stream.rule.to_string(),
                    date.format(DATE_FORMAT).to_string()
                ],
                daily_from_row,
            )
            .optional()
        })
        .await
    }

    async fn put_daily(&self, record: &DailyRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn("put_daily", move |conn| {
            conn.execute(
                "INSERT INTO traffic_daily
                    (port, rule, report_date, base, accumulated, last_raw, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(port, rule, report_date) DO UPDATE SET
                    base = excluded.base,
                    accumulated = excluded.accumulated,
                    last_raw = excluded.last_raw,
                    last_update = excluded.last_update",
                params![
                    record.port.0,
                    record.rule.to_string(),
                    record.date.format(DATE_FORMAT).to_string(),
                    record.base,
                    record.accumulated,
                    record.last_raw,
                    timestamp(&record.last_update)
                ],
            )?;
            debug!("Saved daily {} {}", record.date, record.stream());
            Ok(())
        })
        .await
    }

    async fn get_monthly(
        &self,
        stream: StreamKey,
        month: YearMonth,
    ) -> Result<Option<MonthlyRecord>> {
        self.with_conn("get_monthly", move |conn| {
            conn.query_row(
                "SELECT port, rule, report_month, total, last_update
                 FROM traffic_monthly
                 WHERE port = ?1 AND rule = ?2 AND report_month = ?3",
                params![stream.port.0, stream.rule.to_string(), month.to_string()],
                monthly_from_row,
            )
            .optional()
        })
        .await
    }

    async fn put_monthly(&self, record: &MonthlyRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn("put_monthly", move |conn| {
            conn.execute(
                "INSERT INTO traffic_monthly (port, rule, report_month, total, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(port, rule, report_month) DO UPDATE SET
                    total = excluded.total,
                    last_update = excluded.last_update",
                params![
                    record.port.0,
                    record.rule.to_string(),
                    record.month.to_string(),
                    record.total,
                    timestamp(&record.last_update)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn sum_daily_net_for_month(&self, month: YearMonth) -> Result<Vec<MonthlyTotal>> {
        let pattern = format!("{}-%", month);
        self.with_conn("sum_daily_net_for_month", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT port, rule, SUM(accumulated - base) AS total
                 FROM traffic_daily
                 WHERE report_date LIKE ?1
                 GROUP BY port, rule
                 ORDER BY port, rule",
            )?;
            let rows = stmt.query_map(params![pattern], |row| {
                let total: i64 = row.get(2)?;
                Ok(MonthlyTotal {
                    port: Port(row.get(0)?),
                    rule: rule_column(row, 1)?,
                    total: u64::try_from(total).unwrap_or(0),
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn latest_daily_date(&self) -> Result<Option<NaiveDate>> {
        self.with_conn("latest_daily_date", |conn| {
            let latest: Option<String> =
                conn.query_row("SELECT MAX(report_date) FROM traffic_daily", [], |row| {
                    row.get(0)
                })?;
            latest
                .map(|text| parse_date(&text, 0))
                .transpose()
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        self.with_conn("flush", |conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        })
        .await
    }
}

fn daily_from_row(row: &Row<'_>) -> rusqlite::Result<DailyRecord> {
    let date: String = row.get(2)?;
    Ok(DailyRecord {
        port: Port(row.get(0)?),
        rule: rule_column(row, 1)?,
        date: parse_date(&date, 2)?,
        base: row.get(3)?,
        accumulated: row.get(4)?,
        last_raw: row.get(5)?,
        last_update: timestamp_column(row, 6)?,
    })
}

fn monthly_from_row(row: &Row<'_>) -> rusqlite::Result<MonthlyRecord> {
    let month: String = row.get(2)?;
    Ok(MonthlyRecord {
        port: Port(row.get(0)?),
        rule: rule_column(row, 1)?,
        month: month
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        total: row.get(3)?,
        last_update: timestamp_column(row, 4)?,
    })
}

fn rule_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Rule> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(text: &str, idx: usize) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Factory for creating SQLite record stores
///
/// Accepts `RecordStoreConfig::Sqlite { path }` or a custom config of the
/// form `{ "path": "..." }`.
pub struct SqliteFactory;

#[async_trait]
impl RecordStoreFactory for SqliteFactory {
    async fn create(&self, config: &RecordStoreConfig) -> Result<Box<dyn RecordStore>> {
        let path = match config {
            RecordStoreConfig::Sqlite { path } => path.clone(),
            RecordStoreConfig::Custom { config, .. } => config
                .get("path")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::config("sqlite store requires a 'path'"))?,
            other => {
                return Err(Error::config(format!(
                    "SQLite store factory cannot build a '{}' store",
                    other.type_name()
                )));
            }
        };

        Ok(Box::new(SqliteRecordStore::open(path).await?))
    }
}

/// Register the SQLite record store with a registry
pub fn register(registry: &SourceRegistry) {
    registry.register_record_store("sqlite", Box::new(SqliteFactory));
}
