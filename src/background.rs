//! 上传目录中残留临时文件的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TEMP_CLEAN_INTERVAL_SECS;
use crate::storage::Storage;

/// 启动临时文件清理任务；`ttl` 为零时不启动。
pub fn spawn_background_tasks(storage: Arc<Storage>, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TEMP_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match storage.sweep_temp_files(ttl).await {
                Ok(removed) => debug!(removed, "temp file sweep finished"),
                Err(err) => warn!(error = %err, "temp file sweep failed"),
            }
        }
    });
}
