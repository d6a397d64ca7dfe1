use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;

use super::{Origin, OriginRequest, OriginResponse, ORIGIN_MISS_STATUS};
use crate::secret::ORIGIN_SECRET_HEADER;
use crate::store::{object_key, ObjectStore};
use crate::{Result, ValidatorImageError};

/// Primary origin backed by the object store. A missing object is answered
/// with the miss status, never 404.
pub struct StoreOrigin {
    store: Arc<ObjectStore>,
    miss_status: StatusCode,
}

impl StoreOrigin {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store, miss_status: ORIGIN_MISS_STATUS }
    }

    /// Must match the status the coordinator treats as a miss.
    pub fn with_miss_status(mut self, status: StatusCode) -> Self {
        self.miss_status = status;
        self
    }
}

fn text(status: StatusCode, body: &'static str) -> OriginResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    OriginResponse { status, headers, body: Bytes::from_static(body.as_bytes()) }
}

#[async_trait::async_trait]
impl Origin for StoreOrigin {
    async fn fetch(&self, request: &OriginRequest) -> Result<OriginResponse> {
        let key = object_key(&request.path);
        match self.store.get(&key) {
            Ok(Some(obj)) => {
                let mut headers = HeaderMap::new();
                let meta = &obj.metadata;
                if let Some(v) = meta.content_type.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                    headers.insert(header::CONTENT_TYPE, v);
                }
                if let Some(v) = meta.cache_control.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                    headers.insert(header::CACHE_CONTROL, v);
                }
                Ok(OriginResponse { status: StatusCode::OK, headers, body: obj.bytes })
            }
            Ok(None) => Ok(text(self.miss_status, "Access Denied")),
            Err(e) => {
                tracing::error!("Primary store read failed for {}: {}", key, e);
                Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error"))
            }
        }
    }
}

/// Fallback origin reached over HTTP. Every request carries the shared
/// secret, which is the only thing the fallback trusts.
pub struct HttpFallbackOrigin {
    client: Client,
    base_url: String,
    secret: String,
}

impl HttpFallbackOrigin {
    pub fn new(client: Client, base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into(), secret: secret.into() }
    }
}

#[async_trait::async_trait]
impl Origin for HttpFallbackOrigin {
    async fn fetch(&self, request: &OriginRequest) -> Result<OriginResponse> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), request.path_and_query());

        let resp = self
            .client
            .get(&url)
            .header(ORIGIN_SECRET_HEADER, &self.secret)
            .send()
            .await
            .map_err(|e| ValidatorImageError::OriginUnreachable(e.to_string()))?;

        let status = StatusCode::from_u16(resp.status().as_u16())
            .map_err(|e| ValidatorImageError::OriginUnreachable(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for name in [header::CONTENT_TYPE, header::CACHE_CONTROL] {
            if let Some(v) = resp.headers().get(name.as_str()).and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok()) {
                headers.insert(name, v);
            }
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| ValidatorImageError::OriginUnreachable(e.to_string()))?;

        Ok(OriginResponse { status, headers, body })
    }
}
