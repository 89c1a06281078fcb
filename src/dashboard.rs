//! 上传记录的 HTML 仪表盘。

use axum::extract::Extension;
use axum::response::Html;
use std::fmt::Write;
use std::sync::Arc;

use crate::metadata::{Ledger, UploadRecord};

/// 渲染全部上传记录为图片卡片。
pub async fn dashboard(Extension(ledger): Extension<Arc<Ledger>>) -> Html<String> {
    Html(render_dashboard(&ledger.records().await))
}

pub fn render_dashboard(records: &[UploadRecord]) -> String {
    let mut cards = String::new();
    for record in records {
        let _ = write!(
            cards,
            r#"
    <div class="item">
      <img src="{path}" alt="{filename}" />
      <div class="meta">{filename}<br>Device: {device_id}<br>{timestamp}</div>
    </div>"#,
            path = html_escape(&record.path),
            filename = html_escape(&record.filename),
            device_id = html_escape(&record.device_id),
            timestamp = html_escape(&record.timestamp),
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Uploads Dashboard</title>
<style>
body {{ font-family: sans-serif; margin: 2em; }}
.gallery {{ display: flex; flex-wrap: wrap; gap: 16px; }}
.item {{ border: 1px solid #ccc; padding: 8px; border-radius: 8px; width: 200px; }}
.item img {{ max-width: 100%; border-radius: 4px; }}
.meta {{ font-size: 0.9em; color: #555; margin-top: 4px; word-break: break-all; }}
</style>
</head>
<body>
<h1>Uploads Dashboard</h1>
<div class="gallery">{cards}
</div>
</body>
</html>"#
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
