//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const UPLOAD_FIELD_NAME: &str = "image";
pub const UPLOADS_URL_PREFIX: &str = "/uploads";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const UNKNOWN_DEVICE_ID: &str = "unknown";
pub const ALLOWED_IMAGE_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".gif"];
pub const DEFAULT_API_KEY: &str = "f8932A02-9b4f-44ef-92b1-2f7c0example";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 25 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const DEFAULT_TEMP_TTL_SECS: u64 = 60 * 60;
pub const TEMP_CLEAN_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "snapvault", version = VERSION_INFO, about = "SnapVault image upload server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "SNAPVAULT_UPLOAD_DIR",
        default_value = "uploads",
        help = "Directory where uploaded images are stored"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'm',
        long,
        env = "SNAPVAULT_METADATA_FILE",
        help = "JSON file holding upload records [default: <upload-dir>/metadata.json]"
    )]
    pub metadata_file: Option<String>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "SNAPVAULT_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SNAPVAULT_HTTP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "SNAPVAULT_HTTPS_PORT",
        default_value_t = 3443,
        help = "HTTPS port (only used with --tls-cert and --tls-key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "SNAPVAULT_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "SNAPVAULT_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "SNAPVAULT_API_KEYS",
        value_delimiter = ',',
        default_value = DEFAULT_API_KEY,
        help = "Comma separated API keys accepted by the upload endpoint"
    )]
    pub api_keys: Vec<String>,
    #[arg(
        long,
        env = "SNAPVAULT_CORS_ORIGINS",
        default_value = "*",
        help = "Comma separated CORS origins (* for any)"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SNAPVAULT_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "SNAPVAULT_LOCK_WAIT_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "How long an upload waits for the metadata lock"
    )]
    pub lock_wait_timeout_secs: u64,
    #[arg(
        long,
        env = "SNAPVAULT_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Age after which abandoned temp files are removed (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

impl Args {
    /// 元数据文件路径，未指定时位于上传目录内。
    pub fn metadata_path(&self) -> PathBuf {
        match &self.metadata_file {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.upload_dir).join(METADATA_FILE_NAME),
        }
    }
}
