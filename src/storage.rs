//! 上传目录管理：目录初始化、文件名生成与落盘。

use chrono::Utc;
use rand::Rng;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::{AtomicFile, TEMP_MARKER};
use crate::config::UPLOADS_URL_PREFIX;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 启动时创建上传目录（不递归创建父目录）。
    pub async fn ensure_root(&self) -> io::Result<()> {
        match fs::create_dir(&self.root).await {
            Ok(()) => {
                info!(path = ?self.root, "created upload directory");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将单段文件名解析为上传目录下的绝对路径。
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => Ok(self.root.join(segment)),
            _ => Err(StorageError::InvalidName),
        }
    }

    /// 为新上传的文件创建原子写入句柄。
    pub async fn create(&self, name: &str) -> Result<AtomicFile, StorageError> {
        let target = self.resolve(name)?;
        Ok(AtomicFile::new(&target).await?)
    }

    /// 删除超过 `ttl` 未完成的临时文件，返回删除数量。
    pub async fn sweep_temp_files(&self, ttl: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') || !name.contains(TEMP_MARKER) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = match metadata.modified().map(|ts| now.duration_since(ts)) {
                Ok(Ok(value)) => value,
                _ => continue,
            };
            if age < ttl {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = ?path, "removed stale temp file");
                    removed += 1;
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale temp file"),
            }
        }
        Ok(removed)
    }
}

/// 生成存储文件名：`<field>-<毫秒时间戳>-<随机数><扩展名>`。
pub fn generate_filename(field: &str, extension: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..=1_000_000_000);
    format!("{field}-{millis}-{suffix}{extension}")
}

/// 返回文件的公开访问路径。
pub fn public_path(filename: &str) -> String {
    format!("{UPLOADS_URL_PREFIX}/{filename}")
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
