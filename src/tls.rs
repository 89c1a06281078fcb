//! 可选的 HTTPS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::config::Args;

/// 同时提供证书与私钥时构建 Rustls 配置，否则返回 `None`（仅启用 HTTP）。
pub async fn build_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, std::io::Error> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(cert, key).await?;
            info!(cert, "loaded tls certificate");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "--tls-cert and --tls-key must be given together",
        )),
    }
}
