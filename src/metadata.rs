//! 上传记录的元数据存储：JSON 文件与内存实现，以及串行化写入的账本。

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::atomic::write_atomic;

/// A single stored upload.
///
/// Records written by other tools may lack fields or carry extra ones;
/// missing fields read as empty strings and unknown keys are kept in
/// `extra` so they survive a rewrite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub filename: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub device_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 非字符串值按其 JSON 文本保存。
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => value,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl UploadRecord {
    /// 以当前 UTC 时间创建记录。
    pub fn new(filename: String, path: String, device_id: String) -> Self {
        Self {
            filename,
            path,
            device_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            extra: Map::new(),
        }
    }

    fn same_upload(&self, other: &UploadRecord) -> bool {
        self.filename == other.filename && self.device_id == other.device_id
    }
}

#[derive(Debug)]
pub enum MetadataError {
    Io(io::Error),
    Serialize(serde_json::Error),
    LockTimeout,
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "{err}"),
            MetadataError::Serialize(err) => write!(f, "failed to serialize metadata: {err}"),
            MetadataError::LockTimeout => write!(f, "metadata store is busy"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<io::Error> for MetadataError {
    fn from(err: io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(err: serde_json::Error) -> Self {
        MetadataError::Serialize(err)
    }
}

/// Persistence for the full, insertion-ordered record collection.
///
/// There is no partial update: `save` always replaces everything that
/// `load` would return.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Returns every stored record. A missing or unreadable collection
    /// yields an empty list rather than an error.
    async fn load(&self) -> Vec<UploadRecord>;

    /// Replaces the stored collection with `records`.
    async fn save(&self, records: &[UploadRecord]) -> Result<(), MetadataError>;
}

/// 以单个 JSON 数组文件保存全部记录。
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 启动时确认元数据文件所在目录存在，避免上传落盘后才因保存失败返回 500。
    pub async fn check_parent(&self) -> io::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => return Ok(()),
        };
        let metadata = fs::metadata(parent).await.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("metadata directory {}: {err}", parent.display()),
            )
        })?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("metadata directory {} is not a directory", parent.display()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn load(&self) -> Vec<UploadRecord> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = ?self.path, error = %err, "metadata unreadable, treating as empty");
                return Vec::new();
            }
        };
        let entries: Vec<Value> = match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = ?self.path, error = %err, "metadata corrupt, treating as empty");
                return Vec::new();
            }
        };
        let total = entries.len();
        let records: Vec<UploadRecord> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if records.len() != total {
            warn!(
                path = ?self.path,
                skipped = total - records.len(),
                "metadata entries that are not objects were skipped"
            );
        }
        records
    }

    async fn save(&self, records: &[UploadRecord]) -> Result<(), MetadataError> {
        let contents = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.path, &contents).await?;
        debug!(path = ?self.path, count = records.len(), "metadata saved");
        Ok(())
    }
}

/// 内存实现，进程退出即丢失。
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: std::sync::Mutex<Vec<UploadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load(&self) -> Vec<UploadRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn save(&self, records: &[UploadRecord]) -> Result<(), MetadataError> {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = records.to_vec();
        Ok(())
    }
}

/// Serialises read-modify-write cycles against a [`MetadataStore`].
pub struct Ledger {
    store: Arc<dyn MetadataStore>,
    lock: Mutex<()>,
    lock_timeout: Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn MetadataStore>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// 读取全部记录。
    pub async fn records(&self) -> Vec<UploadRecord> {
        self.store.load().await
    }

    /// Appends `record` unless one with the same filename and device id
    /// already exists. Returns `true` when the record was added.
    pub async fn append_unique(&self, record: UploadRecord) -> Result<bool, MetadataError> {
        let _guard = tokio::time::timeout(self.lock_timeout, self.lock.lock())
            .await
            .map_err(|_| MetadataError::LockTimeout)?;

        let mut records = self.store.load().await;
        if records.iter().any(|existing| existing.same_upload(&record)) {
            debug!(filename = record.filename, "duplicate upload record skipped");
            return Ok(false);
        }
        records.push(record);
        self.store.save(&records).await?;
        Ok(true)
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
