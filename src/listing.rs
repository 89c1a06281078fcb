//! 上传记录列表接口。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use std::sync::Arc;
use tracing::debug;

use crate::metadata::{Ledger, UploadRecord};

/// 按写入顺序返回全部上传记录。
pub async fn list_uploads(
    Extension(ledger): Extension<Arc<Ledger>>,
) -> JsonResponse<Vec<UploadRecord>> {
    let records = ledger.records().await;
    debug!(count = records.len(), "list uploads");
    JsonResponse(records)
}
