//! 上传接口的 API Key 校验。

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::{body::Body as AxumBody, middleware, response::Response};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::API_KEY_HEADER;
use crate::error::ApiError;
use crate::http::resolve_client_ip;

/// Decides whether a presented credential grants upload access.
pub trait KeyValidator: Send + Sync + 'static {
    fn validate(&self, presented: Option<&str>) -> bool;
}

/// A fixed set of shared secrets. Several keys may be active at once so a
/// key can be rotated without downtime.
pub struct StaticKeys {
    keys: Vec<String>,
}

impl StaticKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|key: &String| !key.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyValidator for StaticKeys {
    fn validate(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        let presented = presented.as_bytes();
        // 逐个比较，不提前退出
        self.keys.iter().fold(false, |matched, key| {
            let key = key.as_bytes();
            let equal = key.len() == presented.len() && key.ct_eq(presented).unwrap_u8() == 1;
            matched | equal
        })
    }
}

impl fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeys")
            .field("keys", &self.keys.len())
            .finish()
    }
}

pub struct AuthConfig {
    pub validator: Box<dyn KeyValidator>,
}

impl AuthConfig {
    pub fn new(validator: impl KeyValidator) -> Self {
        Self {
            validator: Box::new(validator),
        }
    }
}

/// 认证中间件：在读取请求体之前校验 `x-api-key`。
pub async fn require_api_key(
    Extension(auth): Extension<Arc<AuthConfig>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if auth.validator.validate(presented) {
        return Ok(next.run(req).await);
    }

    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = resolve_client_ip(req.headers(), connect_ip);
    warn!(
        client_ip = ?client_ip,
        path = req.uri().path(),
        key_present = presented.is_some(),
        "rejected request with invalid api key"
    );
    Err(ApiError::Unauthorized(
        "Unauthorized: Invalid API key".into(),
    ))
}
