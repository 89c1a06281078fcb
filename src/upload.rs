//! 图片上传处理器：校验、落盘并记录元数据。

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::config::{
    ALLOWED_IMAGE_EXTENSIONS, DEVICE_ID_HEADER, UNKNOWN_DEVICE_ID, UPLOAD_FIELD_NAME,
};
use crate::error::ApiError;
use crate::metadata::{Ledger, UploadRecord};
use crate::storage::{Storage, generate_filename, public_path};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    message: &'static str,
    filename: String,
    path: String,
}

#[derive(Debug)]
struct StoredFile {
    filename: String,
    original_name: String,
    size: u64,
}

/// 接收单个图片文件并追加上传记录。
pub async fn upload_image(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::BadRequest("No file uploaded".into()));
    };
    let Some(stored) = receive_image(&storage, &mut multipart).await? else {
        return Err(ApiError::BadRequest("No file uploaded".into()));
    };

    let device_id = device_id(&headers);
    let path = public_path(&stored.filename);

    let record = UploadRecord::new(stored.filename.clone(), path.clone(), device_id.clone());
    if let Err(err) = ledger.append_unique(record).await {
        error!(
            filename = stored.filename,
            error = %err,
            "failed to record upload metadata, file left without record"
        );
        return Err(err.into());
    }

    info!(
        filename = stored.filename,
        original_name = stored.original_name,
        device_id,
        size = stored.size,
        "image uploaded"
    );
    Ok(JsonResponse(UploadResponse {
        message: "File uploaded successfully",
        filename: stored.filename,
        path,
    }))
}

/// 读取 multipart 字段，写入唯一的 `image` 文件；出错时删除已写入的文件。
async fn receive_image(
    storage: &Storage,
    multipart: &mut Multipart,
) -> Result<Option<StoredFile>, ApiError> {
    let mut stored: Option<StoredFile> = None;
    let result: Result<(), ApiError> = async {
        while let Some(mut field) = multipart.next_field().await? {
            let Some(original_name) = field.file_name().map(str::to_string) else {
                continue;
            };
            if field.name() != Some(UPLOAD_FIELD_NAME) || stored.is_some() {
                warn!(field = field.name(), "unexpected file field");
                return Err(ApiError::BadRequest("Unexpected field".into()));
            }
            let Some(extension) = allowed_extension(&original_name) else {
                warn!(original_name, "rejected non-image upload");
                return Err(ApiError::BadRequest("Only image files are allowed!".into()));
            };

            let filename = generate_filename(UPLOAD_FIELD_NAME, extension);
            let size = write_field(storage, &filename, &mut field).await?;
            stored = Some(StoredFile {
                filename,
                original_name,
                size,
            });
        }
        Ok(())
    }
    .await;

    if let Err(err) = result {
        if let Some(file) = stored {
            discard(storage, &file.filename).await;
        }
        return Err(err);
    }
    Ok(stored)
}

/// 读取设备标识头；非 UTF-8 字节按 Latin-1 解码，缺失或为空时为 `unknown`。
fn device_id(headers: &HeaderMap) -> String {
    let Some(value) = headers.get(DEVICE_ID_HEADER) else {
        return UNKNOWN_DEVICE_ID.to_string();
    };
    let bytes = value.as_bytes();
    let decoded = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("device id header is not utf-8, decoding as latin-1");
            bytes.iter().map(|&byte| char::from(byte)).collect()
        }
    };
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        UNKNOWN_DEVICE_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// 返回文件名匹配的图片扩展名（区分大小写）。
pub fn allowed_extension(original_name: &str) -> Option<&'static str> {
    ALLOWED_IMAGE_EXTENSIONS
        .iter()
        .copied()
        .find(|extension| original_name.ends_with(extension))
}

async fn write_field(
    storage: &Storage,
    filename: &str,
    field: &mut Field<'_>,
) -> Result<u64, ApiError> {
    let mut file = storage.create(filename).await?;
    let write_result: Result<u64, ApiError> = async {
        let mut total_written: u64 = 0;
        while let Some(chunk) = field.chunk().await? {
            total_written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        Ok(total_written)
    }
    .await;

    match write_result {
        Ok(total_written) => {
            file.finalize()
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            Ok(total_written)
        }
        Err(err) => {
            file.cleanup().await;
            Err(err)
        }
    }
}

async fn discard(storage: &Storage, filename: &str) {
    let Ok(path) = storage.resolve(filename) else {
        return;
    };
    if let Err(err) = fs::remove_file(&path).await {
        warn!(path = ?path, error = %err, "failed to remove rejected upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::{HeaderValue, Request, StatusCode, header};
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::metadata::{MemoryStore, MetadataError, MetadataStore};

    const BOUNDARY: &str = "snapvault-test-boundary";

    struct Part<'a> {
        name: &'a str,
        filename: Option<&'a str>,
        data: &'a [u8],
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part.filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        part.name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        part.name
                    )
                    .as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    async fn multipart(parts: &[Part<'_>]) -> Result<Multipart, MultipartRejection> {
        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(multipart_body(parts)))
            .expect("request");
        Ok(Multipart::from_request(request, &())
            .await
            .expect("multipart extractor"))
    }

    async fn no_multipart() -> Result<Multipart, MultipartRejection> {
        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from("{}"))
            .expect("request");
        Multipart::from_request(request, &()).await
    }

    fn make_state() -> (tempfile::TempDir, Arc<Storage>, Arc<Ledger>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create upload dir");
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(5),
        ));
        (temp, Arc::new(Storage::new(root)), ledger)
    }

    fn device_headers(device_id: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(DEVICE_ID_HEADER, HeaderValue::from_static(device_id));
        headers
    }

    fn stored_files(storage: &Storage) -> Vec<String> {
        std::fs::read_dir(storage.root_path())
            .expect("read upload dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn allowed_extension_is_case_sensitive_suffix() {
        assert_eq!(allowed_extension("photo.jpg"), Some(".jpg"));
        assert_eq!(allowed_extension("photo.jpeg"), Some(".jpeg"));
        assert_eq!(allowed_extension("archive.tar.gif"), Some(".gif"));
        assert_eq!(allowed_extension("a.png"), Some(".png"));
        assert_eq!(allowed_extension("photo.JPG"), None);
        assert_eq!(allowed_extension("photo.jpg.exe"), None);
        assert_eq!(allowed_extension("notes.txt"), None);
    }

    #[tokio::test]
    async fn upload_stores_bytes_and_records_device() {
        let (_temp, storage, ledger) = make_state();
        let data = b"\x89PNG fake image bytes";

        let JsonResponse(response) = upload_image(
            Extension(storage.clone()),
            Extension(ledger.clone()),
            device_headers("device-42"),
            multipart(&[Part {
                name: "image",
                filename: Some("photo.png"),
                data,
            }])
            .await,
        )
        .await
        .expect("upload succeeds");

        assert_eq!(response.message, "File uploaded successfully");
        assert!(response.filename.starts_with("image-"));
        assert!(response.filename.ends_with(".png"));
        assert_eq!(response.path, format!("/uploads/{}", response.filename));
        let on_disk = std::fs::read(storage.root_path().join(&response.filename)).expect("file");
        assert_eq!(on_disk, data);

        let records = ledger.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].filename, response.filename);
        assert_eq!(records[0].path, response.path);
        assert_eq!(records[0].device_id, "device-42");
    }

    #[tokio::test]
    async fn missing_device_header_defaults_to_unknown() {
        let (_temp, storage, ledger) = make_state();

        let JsonResponse(response) = upload_image(
            Extension(storage),
            Extension(ledger.clone()),
            HeaderMap::new(),
            multipart(&[Part {
                name: "image",
                filename: Some("cat.gif"),
                data: b"GIF89a",
            }])
            .await,
        )
        .await
        .expect("upload succeeds");

        let records = ledger.records().await;
        assert_eq!(records[0].filename, response.filename);
        assert_eq!(records[0].device_id, "unknown");
    }

    #[tokio::test]
    async fn rejects_non_image_without_writing() {
        let (_temp, storage, ledger) = make_state();

        let result = upload_image(
            Extension(storage.clone()),
            Extension(ledger.clone()),
            HeaderMap::new(),
            multipart(&[Part {
                name: "image",
                filename: Some("notes.txt"),
                data: b"hello",
            }])
            .await,
        )
        .await;

        match result {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "Only image files are allowed!"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(stored_files(&storage).is_empty());
        assert!(ledger.records().await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_field_is_rejected() {
        let (_temp, storage, ledger) = make_state();

        let result = upload_image(
            Extension(storage.clone()),
            Extension(ledger.clone()),
            HeaderMap::new(),
            multipart(&[Part {
                name: "caption",
                filename: None,
                data: b"no file here",
            }])
            .await,
        )
        .await;

        match result {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "No file uploaded"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(ledger.records().await.is_empty());
    }

    #[tokio::test]
    async fn non_multipart_request_is_missing_file() {
        let (_temp, storage, ledger) = make_state();

        let result = upload_image(
            Extension(storage),
            Extension(ledger),
            HeaderMap::new(),
            no_multipart().await,
        )
        .await;

        match result {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "No file uploaded"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_image_discards_the_first() {
        let (_temp, storage, ledger) = make_state();

        let result = upload_image(
            Extension(storage.clone()),
            Extension(ledger.clone()),
            HeaderMap::new(),
            multipart(&[
                Part {
                    name: "image",
                    filename: Some("one.jpg"),
                    data: b"one",
                },
                Part {
                    name: "image",
                    filename: Some("two.jpg"),
                    data: b"two",
                },
            ])
            .await,
        )
        .await;

        match result {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, "Unexpected field"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(stored_files(&storage).is_empty());
        assert!(ledger.records().await.is_empty());
    }

    #[tokio::test]
    async fn file_under_other_field_name_is_rejected() {
        let (_temp, storage, ledger) = make_state();

        let result = upload_image(
            Extension(storage.clone()),
            Extension(ledger),
            HeaderMap::new(),
            multipart(&[Part {
                name: "photo",
                filename: Some("one.jpg"),
                data: b"one",
            }])
            .await,
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(stored_files(&storage).is_empty());
    }

    #[test]
    fn device_id_decodes_non_ascii_header_bytes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            DEVICE_ID_HEADER,
            HeaderValue::from_bytes("kamera-köln".as_bytes()).expect("utf-8 header"),
        );
        assert_eq!(device_id(&headers), "kamera-köln");

        headers.insert(
            DEVICE_ID_HEADER,
            HeaderValue::from_bytes(b"caf\xe9").expect("latin-1 header"),
        );
        assert_eq!(device_id(&headers), "caf\u{e9}");

        headers.insert(DEVICE_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(device_id(&headers), "unknown");
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl MetadataStore for FailingStore {
        async fn load(&self) -> Vec<UploadRecord> {
            Vec::new()
        }

        async fn save(&self, _records: &[UploadRecord]) -> Result<(), MetadataError> {
            Err(MetadataError::Io(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test]
    async fn metadata_failure_returns_500_and_keeps_file() {
        let (_temp, storage, _) = make_state();
        let ledger = Arc::new(Ledger::new(Arc::new(FailingStore), Duration::from_secs(1)));

        let result = upload_image(
            Extension(storage.clone()),
            Extension(ledger),
            device_headers("device-7"),
            multipart(&[Part {
                name: "image",
                filename: Some("photo.jpeg"),
                data: b"jpeg bytes",
            }])
            .await,
        )
        .await;

        let err = match result {
            Err(err) => err,
            Ok(response) => panic!("upload should fail: {response:?}"),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["error"], "disk full");

        let files = stored_files(&storage);
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("image-") && files[0].ends_with(".jpeg"));
    }
}
