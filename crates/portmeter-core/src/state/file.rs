// # File Record Store
//
// File-based implementation of RecordStore with crash recovery.
//
// ## Purpose
//
// Keeps the daily and monthly tables in a single JSON document so that a
// restarted daemon resumes reconciliation from the last persisted readings.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "daily": [
//     {
//       "port": 12450,
//       "rule": "input_tcp",
//       "date": "2024-05-01",
//       "base": 1000,
//       "accumulated": 1500,
//       "last_raw": 1500,
//       "last_update": "2024-05-01T12:00:00Z"
//     }
//   ],
//   "monthly": []
// }
// ```

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::tables::RecordTables;
use crate::Error;
use crate::config::RecordStoreConfig;
use crate::model::{DailyRecord, MonthlyRecord, MonthlyTotal, StreamKey, YearMonth};
use crate::traits::record_store::{RecordStore, RecordStoreFactory};

/// Records file format version
/// Used for future migration if format changes
const RECORDS_FILE_VERSION: &str = "1.0";

/// File-based record store with crash recovery
///
/// Every upsert rewrites the file before returning, so an acknowledged
/// write survives a crash.
///
/// # Example
///
/// ```rust,no_run
/// use portmeter_core::state::FileRecordStore;
/// use portmeter_core::traits::RecordStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileRecordStore::new("/var/lib/portmeter/records.json").await?;
///
///     let latest = store.latest_daily_date().await?;
///     println!("latest recorded day: {:?}", latest);
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
}

/// Internal state for file-based store
#[derive(Debug)]
struct FileState {
    tables: RecordTables,
    dirty: bool,
}

/// Serializable records file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RecordsFileFormat {
    version: String,
    #[serde(default)]
    daily: Vec<DailyRecord>,
    #[serde(default)]
    monthly: Vec<MonthlyRecord>,
}

/// Why loading the records file failed
enum LoadError {
    /// The file exists but is not a valid records document
    Corrupted(Error),
    /// The file could not be read at all
    Unreadable(Error),
}

impl FileRecordStore {
    /// Create or load a file record store
    ///
    /// This will:
    /// 1. Try to load existing records file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with empty tables
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create records directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tables = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                tables,
                dirty: false,
            })),
        })
    }

    /// Load records with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main records file
    /// 2. If it is corrupted, try loading the backup
    /// 3. If the backup also fails, start with empty tables
    async fn load_with_recovery(path: &Path) -> Result<RecordTables, Error> {
        let error = match Self::load(path).await {
            Ok(tables) => {
                tracing::debug!(
                    "Loaded {} daily and {} monthly records from file",
                    tables.daily_len(),
                    tables.monthly_len()
                );
                return Ok(tables);
            }
            Err(LoadError::Unreadable(e)) => return Err(e),
            Err(LoadError::Corrupted(e)) => e,
        };

        tracing::warn!(
            "Records file appears corrupted: {}. Attempting recovery from backup.",
            error
        );

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            tracing::warn!("No backup file found. Starting with empty records.");
            return Ok(RecordTables::default());
        }

        match Self::load(&backup_path).await {
            Ok(tables) => {
                tracing::info!(
                    "Recovered records from backup: {} daily records",
                    tables.daily_len()
                );

                if let Err(restore_err) = Self::restore_from_backup(path, &backup_path).await {
                    tracing::error!("Failed to restore records file from backup: {}", restore_err);
                }

                Ok(tables)
            }
            Err(LoadError::Corrupted(backup_err)) | Err(LoadError::Unreadable(backup_err)) => {
                tracing::error!(
                    "Backup also unusable: {}. Starting with empty records.",
                    backup_err
                );
                Ok(RecordTables::default())
            }
        }
    }

    /// Load records from file
    async fn load(path: &Path) -> Result<RecordTables, LoadError> {
        if !path.exists() {
            tracing::debug!("Records file does not exist: {}", path.display());
            return Ok(RecordTables::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadError::Unreadable(Error::record_store(format!(
                "Failed to read records file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: RecordsFileFormat = serde_json::from_str(&content).map_err(|e| {
            LoadError::Corrupted(Error::record_store(format!(
                "Failed to parse records file {}: {}",
                path.display(),
                e
            )))
        })?;

        if file.version != RECORDS_FILE_VERSION {
            tracing::warn!(
                "Records file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                RECORDS_FILE_VERSION,
                file.version
            );
        }

        Ok(RecordTables::from_records(file.daily, file.monthly))
    }

    /// Write all records to file atomically
    async fn write_state(&self) -> Result<(), Error> {
        // Held for the whole write so concurrent upserts cannot interleave
        // their renames.
        let mut state_guard = self.state.write().await;

        let file = RecordsFileFormat {
            version: RECORDS_FILE_VERSION.to_string(),
            daily: state_guard.tables.daily_records(),
            monthly: state_guard.tables.monthly_records(),
        };

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::record_store(format!("Failed to serialize records: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut temp = fs::File::create(&temp_path).await.map_err(|e| {
                Error::record_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            temp.write_all(json.as_bytes()).await.map_err(|e| {
                Error::record_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            temp.sync_all().await.map_err(|e| {
                Error::record_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::record_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        state_guard.dirty = false;
        tracing::trace!("Records written to file: {}", self.path.display());
        Ok(())
    }

    /// Restore records file from backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::record_store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored records file from backup");
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the records file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get_daily(&self, stream: StreamKey, date: NaiveDate) -> Result<Option<DailyRecord>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.tables.get_daily(stream, date).cloned())
    }

    async fn put_daily(&self, record: &DailyRecord) -> Result<(), Error> {
        {
            let mut state_guard = self.state.write().await;
            state_guard.tables.put_daily(record.clone());
            state_guard.dirty = true;
        }

        // Immediate write for durability
        self.write_state().await
    }

    async fn get_monthly(
        &self,
        stream: StreamKey,
        month: YearMonth,
    ) -> Result<Option<MonthlyRecord>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.tables.get_monthly(stream, month).cloned())
    }

    async fn put_monthly(&self, record: &MonthlyRecord) -> Result<(), Error> {
        {
            let mut state_guard = self.state.write().await;
            state_guard.tables.put_monthly(record.clone());
            state_guard.dirty = true;
        }

        // Immediate write for durability
        self.write_state().await
    }

    async fn sum_daily_net_for_month(&self, month: YearMonth) -> Result<Vec<MonthlyTotal>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.tables.sum_daily_net_for_month(month))
    }

    async fn latest_daily_date(&self) -> Result<Option<NaiveDate>, Error> {
        let state_guard = self.state.read().await;
        Ok(state_guard.tables.latest_daily_date())
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty {
            self.write_state().await
        } else {
            Ok(())
        }
    }
}

/// Factory registered under the name `file`
pub struct FileRecordStoreFactory;

#[async_trait]
impl RecordStoreFactory for FileRecordStoreFactory {
    async fn create(&self, config: &RecordStoreConfig) -> Result<Box<dyn RecordStore>, Error> {
        match config {
            RecordStoreConfig::File { path } => Ok(Box::new(FileRecordStore::new(path).await?)),
            other => Err(Error::config(format!(
                "File store factory cannot build a '{}' store",
                other.type_name()
            ))),
        }
    }
}
