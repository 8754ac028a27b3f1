//! Versioned, append-only listing table.
//!
//! Layout under the table root:
//!
//! ```text
//! _current                       committed version number (replaced atomically)
//! _log/00000000000000000003.json commit entry for version 3
//! segments/v00000003-<uuid>.parquet
//! _writer.lock                   present while a merge is in flight
//! ```
//!
//! A version lists the segments of its parent plus at most one new segment. Later
//! segments win when they carry the same identifier, so unchanged rows are never
//! rewritten. Readers only follow `_current`, so they never observe a partial commit.
//! A log entry past the pointer belongs to a commit that never published; the next
//! writer replaces it.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arrow_array::{Array, ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use estate_core::{Price, Record, RentOrBuy, Target, CANONICAL_CURRENCY};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{sha256_hex, write_atomic};

const CURRENT_POINTER: &str = "_current";
const LOG_DIR: &str = "_log";
const SEGMENT_DIR: &str = "segments";
const WRITER_LOCK: &str = "_writer.lock";

/// Column order of every segment written by this version of the store.
pub const RECORD_COLUMNS: [&str; 14] = [
    "identifier",
    "title",
    "address",
    "price_amount",
    "price_currency",
    "area_sqm",
    "latitude",
    "longitude",
    "source_url",
    "collected_at",
    "search_city",
    "search_property_type",
    "search_rent_or_buy",
    "search_radius",
];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table writer lock is held ({holder})")]
    WriterLocked { holder: String },
    #[error("table advanced from version {expected:?} to {found:?} during the merge")]
    VersionConflict {
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("table io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error("invalid commit entry {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt table data: {0}")]
    Corrupt(String),
    #[error("segment reader task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl TableError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetrics {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub path: String,
    pub sha256: String,
    pub rows: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub version: u64,
    pub parent: Option<u64>,
    pub committed_at: DateTime<Utc>,
    pub record_count: usize,
    pub schema: Vec<String>,
    pub segments: Vec<SegmentRef>,
    pub metrics: CommitMetrics,
}

/// Immutable view of one committed version, keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSnapshot {
    pub version: Option<u64>,
    pub records: BTreeMap<String, Record>,
}

impl TableSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&Record> {
        self.records.get(identifier)
    }

    pub fn to_records(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
    write_gate: Arc<Mutex<()>>,
    stale_lock_after: chrono::Duration,
}

impl TableStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_gate: Arc::new(Mutex::new(())),
            stale_lock_after: chrono::Duration::minutes(30),
        }
    }

    pub fn with_stale_lock_after(mut self, after: chrono::Duration) -> Self {
        self.stale_lock_after = after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn current_version(&self) -> Result<Option<u64>, TableError> {
        read_pointer(&self.root.join(CURRENT_POINTER)).await
    }

    pub async fn commit_entry(&self, version: u64) -> Result<CommitEntry, TableError> {
        let path = log_path(&self.root, version);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| TableError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|source| TableError::Json { path, source })
    }

    /// Committed versions, oldest first. Log entries past the pointer are ignored.
    pub async fn versions(&self) -> Result<Vec<CommitEntry>, TableError> {
        let Some(current) = self.current_version().await? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for version in 1..=current {
            entries.push(self.commit_entry(version).await?);
        }
        Ok(entries)
    }

    pub async fn snapshot(&self) -> Result<TableSnapshot, TableError> {
        match self.current_version().await? {
            Some(version) => self.snapshot_at(version).await,
            None => Ok(TableSnapshot::default()),
        }
    }

    pub async fn snapshot_at(&self, version: u64) -> Result<TableSnapshot, TableError> {
        let entry = self.commit_entry(version).await?;
        load_snapshot(&self.root, &entry).await
    }

    /// Take the single-writer lock: an in-process gate plus an on-disk lock file
    /// so separate processes honour the same discipline.
    pub async fn try_begin_write(&self) -> Result<TableWriter, TableError> {
        let gate = self
            .write_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| TableError::WriterLocked {
                holder: "this process".to_string(),
            })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| TableError::io(&self.root, e))?;
        let lock_path = self.root.join(WRITER_LOCK);
        if !create_lock_file(&lock_path).await? {
            let holder = read_lock(&lock_path).await;
            // An unreadable lock file was cut short mid-write; its mtime stands in.
            let stale = match &holder {
                Some(info) => Utc::now() - info.acquired_at > self.stale_lock_after,
                None => lock_age(&lock_path)
                    .await
                    .is_some_and(|age| age > self.stale_lock_after),
            };
            if !stale {
                return Err(TableError::WriterLocked {
                    holder: holder
                        .map(|info| format!("pid {} since {}", info.pid, info.acquired_at))
                        .unwrap_or_else(|| "unknown holder".to_string()),
                });
            }
            warn!(path = %lock_path.display(), "removing stale table writer lock");
            let _ = fs::remove_file(&lock_path).await;
            if !create_lock_file(&lock_path).await? {
                return Err(TableError::WriterLocked {
                    holder: "concurrent writer".to_string(),
                });
            }
        }

        let base_version = match self.current_version().await {
            Ok(version) => version,
            Err(err) => {
                let _ = fs::remove_file(&lock_path).await;
                return Err(err);
            }
        };
        let base_entry = match base_version {
            Some(version) => match self.commit_entry(version).await {
                Ok(entry) => Some(entry),
                Err(err) => {
                    let _ = fs::remove_file(&lock_path).await;
                    return Err(err);
                }
            },
            None => None,
        };

        Ok(TableWriter {
            root: self.root.clone(),
            lock_path,
            base_entry,
            _gate: gate,
        })
    }
}

/// Exclusive write handle. Dropping it without committing releases the lock and
/// leaves the table at its base version.
#[derive(Debug)]
pub struct TableWriter {
    root: PathBuf,
    lock_path: PathBuf,
    base_entry: Option<CommitEntry>,
    _gate: OwnedMutexGuard<()>,
}

impl TableWriter {
    pub fn base_version(&self) -> Option<u64> {
        self.base_entry.as_ref().map(|e| e.version)
    }

    pub async fn base_snapshot(&self) -> Result<TableSnapshot, TableError> {
        match &self.base_entry {
            Some(entry) => load_snapshot(&self.root, entry).await,
            None => Ok(TableSnapshot::default()),
        }
    }

    /// Publish a new version holding `changed` on top of the base version.
    pub async fn commit(
        self,
        changed: &[Record],
        metrics: CommitMetrics,
    ) -> Result<CommitEntry, TableError> {
        let base_version = self.base_version();
        let found = read_pointer(&self.root.join(CURRENT_POINTER)).await?;
        if found != base_version {
            return Err(TableError::VersionConflict {
                expected: base_version,
                found,
            });
        }
        let version = base_version.map_or(1, |v| v + 1);

        let mut segments = self
            .base_entry
            .as_ref()
            .map(|e| e.segments.clone())
            .unwrap_or_default();
        if !changed.is_empty() {
            segments.push(write_segment(&self.root, version, changed).await?);
        }

        let mut schema = self
            .base_entry
            .as_ref()
            .map(|e| e.schema.clone())
            .unwrap_or_default();
        for column in RECORD_COLUMNS {
            if !schema.iter().any(|c| c == column) {
                schema.push(column.to_string());
            }
        }

        let entry = CommitEntry {
            version,
            parent: base_version,
            committed_at: Utc::now(),
            record_count: self.base_entry.as_ref().map_or(0, |e| e.record_count) + metrics.inserted,
            schema,
            segments,
            metrics,
        };

        let log_file = log_path(&self.root, version);
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|source| TableError::Json {
            path: log_file.clone(),
            source,
        })?;
        write_log_entry(&log_file, &bytes).await?;

        let pointer = self.root.join(CURRENT_POINTER);
        write_atomic(&pointer, version.to_string().as_bytes())
            .await
            .map_err(|e| TableError::io(&pointer, e))?;

        info!(
            version,
            inserted = metrics.inserted,
            updated = metrics.updated,
            unchanged = metrics.unchanged,
            records = entry.record_count,
            "committed table version"
        );
        Ok(entry)
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn log_path(root: &Path, version: u64) -> PathBuf {
    root.join(LOG_DIR).join(format!("{version:020}.json"))
}

async fn read_pointer(path: &Path) -> Result<Option<u64>, TableError> {
    match fs::read_to_string(path).await {
        Ok(text) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TableError::Corrupt(format!("bad version pointer {:?}", text.trim()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(TableError::io(path, err)),
    }
}

async fn create_lock_file(path: &Path) -> Result<bool, TableError> {
    let info = LockInfo {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&info).map_err(|source| TableError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
    {
        Ok(mut file) => {
            file.write_all(&bytes)
                .await
                .map_err(|e| TableError::io(path, e))?;
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(TableError::io(path, err)),
    }
}

async fn read_lock(path: &Path) -> Option<LockInfo> {
    let text = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&text).ok()
}

async fn lock_age(path: &Path) -> Option<chrono::Duration> {
    let modified: SystemTime = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(Utc::now() - DateTime::<Utc>::from(modified))
}

/// Write the entry for a version the pointer has not reached yet. The caller holds
/// the writer lock and has checked the pointer, so an existing file there is orphaned.
async fn write_log_entry(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    if fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "replacing orphaned commit entry");
    }
    write_atomic(path, bytes)
        .await
        .map_err(|e| TableError::io(path, e))
}

async fn write_segment(root: &Path, version: u64, records: &[Record]) -> Result<SegmentRef, TableError> {
    let relative = format!("{SEGMENT_DIR}/v{version:08}-{}.parquet", Uuid::new_v4());
    let path = root.join(&relative);
    let batch = records_to_batch(records)?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;

    write_atomic(&path, &buffer)
        .await
        .map_err(|e| TableError::io(&path, e))?;
    Ok(SegmentRef {
        path: relative,
        sha256: sha256_hex(&buffer),
        rows: records.len(),
        bytes: buffer.len() as u64,
    })
}

async fn load_snapshot(root: &Path, entry: &CommitEntry) -> Result<TableSnapshot, TableError> {
    let root = root.to_path_buf();
    let entry = entry.clone();
    tokio::task::spawn_blocking(move || read_snapshot(&root, &entry)).await?
}

fn read_snapshot(root: &Path, entry: &CommitEntry) -> Result<TableSnapshot, TableError> {
    let mut records = BTreeMap::new();
    for segment in &entry.segments {
        for record in read_segment(&root.join(&segment.path))? {
            records.insert(record.identifier.clone(), record);
        }
    }
    Ok(TableSnapshot {
        version: Some(entry.version),
        records,
    })
}

pub fn records_to_batch(records: &[Record]) -> Result<RecordBatch, TableError> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identifier", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("address", DataType::Utf8, true),
        ArrowField::new("price_amount", DataType::Float64, true),
        ArrowField::new("price_currency", DataType::Utf8, true),
        ArrowField::new("area_sqm", DataType::Float64, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("collected_at", DataType::Utf8, false),
        ArrowField::new("search_city", DataType::Utf8, true),
        ArrowField::new("search_property_type", DataType::Utf8, true),
        ArrowField::new("search_rent_or_buy", DataType::Utf8, true),
        ArrowField::new("search_radius", DataType::UInt32, true),
    ]));

    let columns: Vec<ArrayRef> = vec![
        utf8_column(records, |r| Some(r.identifier.clone())),
        utf8_column(records, |r| r.title.clone()),
        utf8_column(records, |r| r.address.clone()),
        float_column_of(records, |r| r.price.as_ref().map(|p| p.amount)),
        utf8_column(records, |r| r.price.as_ref().map(|p| p.currency.clone())),
        float_column_of(records, |r| r.area_sqm),
        float_column_of(records, |r| r.latitude),
        float_column_of(records, |r| r.longitude),
        utf8_column(records, |r| Some(r.source_url.clone())),
        utf8_column(records, |r| Some(r.collected_at.to_rfc3339())),
        utf8_column(records, |r| r.search.as_ref().map(|t| t.city.clone())),
        utf8_column(records, |r| r.search.as_ref().map(|t| t.property_type.clone())),
        utf8_column(records, |r| r.search.as_ref().map(|t| t.rent_or_buy.to_string())),
        Arc::new(UInt32Array::from(
            records
                .iter()
                .map(|r| r.search.as_ref().map(|t| t.radius))
                .collect::<Vec<_>>(),
        )),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn utf8_column(records: &[Record], value: impl Fn(&Record) -> Option<String>) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(value).collect::<Vec<_>>()))
}

fn float_column_of(records: &[Record], value: impl Fn(&Record) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(records.iter().map(value).collect::<Vec<_>>()))
}

fn required_string<'a>(
    batch: &'a RecordBatch,
    name: &str,
    path: &Path,
) -> Result<&'a StringArray, TableError> {
    string_column(batch, name)?
        .ok_or_else(|| TableError::Corrupt(format!("segment {} lacks {name}", path.display())))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<Option<&'a StringArray>, TableError> {
    match batch.column_by_name(name) {
        None => Ok(None),
        Some(col) => col
            .as_any()
            .downcast_ref::<StringArray>()
            .map(Some)
            .ok_or_else(|| TableError::Corrupt(format!("column {name} is not utf8"))),
    }
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<Option<&'a Float64Array>, TableError> {
    match batch.column_by_name(name) {
        None => Ok(None),
        Some(col) => col
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(Some)
            .ok_or_else(|| TableError::Corrupt(format!("column {name} is not float64"))),
    }
}

fn string_at(col: Option<&StringArray>, row: usize) -> Option<String> {
    col.filter(|c| !c.is_null(row)).map(|c| c.value(row).to_string())
}

fn float_at(col: Option<&Float64Array>, row: usize) -> Option<f64> {
    col.filter(|c| !c.is_null(row)).map(|c| c.value(row))
}

/// Decode a segment. Columns absent from older segments read as null.
pub fn read_segment(path: &Path) -> Result<Vec<Record>, TableError> {
    let file = File::open(path).map_err(|e| TableError::io(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let identifiers = required_string(&batch, "identifier", path)?;
        let source_urls = required_string(&batch, "source_url", path)?;
        let collected = required_string(&batch, "collected_at", path)?;
        let titles = string_column(&batch, "title")?;
        let addresses = string_column(&batch, "address")?;
        let price_amounts = float_column(&batch, "price_amount")?;
        let price_currencies = string_column(&batch, "price_currency")?;
        let areas = float_column(&batch, "area_sqm")?;
        let lats = float_column(&batch, "latitude")?;
        let lons = float_column(&batch, "longitude")?;
        let cities = string_column(&batch, "search_city")?;
        let property_types = string_column(&batch, "search_property_type")?;
        let rent_or_buy = string_column(&batch, "search_rent_or_buy")?;
        let radius = match batch.column_by_name("search_radius") {
            None => None,
            Some(col) => Some(
                col.as_any()
                    .downcast_ref::<UInt32Array>()
                    .ok_or_else(|| TableError::Corrupt("column search_radius is not uint32".into()))?,
            ),
        };

        for row in 0..batch.num_rows() {
            let collected_at = DateTime::parse_from_rfc3339(collected.value(row))
                .map_err(|e| TableError::Corrupt(format!("bad collected_at: {e}")))?
                .with_timezone(&Utc);
            let price = float_at(price_amounts, row).map(|amount| Price {
                amount,
                currency: string_at(price_currencies, row)
                    .unwrap_or_else(|| CANONICAL_CURRENCY.to_string()),
            });
            let search = match (string_at(cities, row), string_at(property_types, row)) {
                (Some(city), Some(property_type)) => Some(Target {
                    city,
                    property_type,
                    rent_or_buy: string_at(rent_or_buy, row)
                        .and_then(|v| RentOrBuy::parse(&v))
                        .unwrap_or_default(),
                    radius: radius
                        .filter(|c| !c.is_null(row))
                        .map(|c| c.value(row))
                        .unwrap_or(0),
                }),
                _ => None,
            };

            out.push(Record {
                identifier: identifiers.value(row).to_string(),
                title: string_at(titles, row),
                address: string_at(addresses, row),
                price,
                area_sqm: float_at(areas, row),
                latitude: float_at(lats, row),
                longitude: float_at(lons, row),
                source_url: source_urls.value(row).to_string(),
                collected_at,
                search,
            });
        }
    }
    Ok(out)
}
