//! Edge layer: edge cache, primary store with authenticated fallback, and the
//! response header policy applied on the way back to the client.

pub mod origin;
pub mod policy;

pub use origin::{HttpFallbackOrigin, StoreOrigin};
pub use policy::{cache_key, response_headers_middleware, ttl_for};

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;

use crate::config::CachePolicy;
use crate::store::{ObjectStore, StoredObject};
use crate::Result;

/// Primary-store status meaning "no such object". The store denies existence
/// instead of answering 404.
pub const ORIGIN_MISS_STATUS: StatusCode = StatusCode::FORBIDDEN;

pub fn is_origin_miss(status: StatusCode) -> bool {
    status == ORIGIN_MISS_STATUS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginState {
    TryPrimary,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// Request path including the leading slash.
    pub path: String,
    pub query: Option<String>,
}

impl OriginRequest {
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait::async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: &OriginRequest) -> Result<OriginResponse>;
}

/// Response together with the state that produced it.
#[derive(Debug)]
pub struct Routed {
    pub state: OriginState,
    pub response: OriginResponse,
}

/// Origin group: the primary store first, the fallback only on an origin miss.
///
/// Any other primary status, 5xx included, is returned as is. Nothing is
/// retried; the first response from either state ends the request.
#[derive(Clone)]
pub struct OriginFallbackCoordinator {
    primary: Arc<dyn Origin>,
    fallback: Arc<dyn Origin>,
    miss_status: Option<StatusCode>,
}

impl OriginFallbackCoordinator {
    pub fn new(primary: Arc<dyn Origin>, fallback: Arc<dyn Origin>) -> Self {
        Self { primary, fallback, miss_status: None }
    }

    /// Overrides [`ORIGIN_MISS_STATUS`] as the status that triggers fallback.
    pub fn with_miss_status(mut self, status: StatusCode) -> Self {
        self.miss_status = Some(status);
        self
    }

    pub fn is_miss(&self, status: StatusCode) -> bool {
        match self.miss_status {
            Some(miss) => status == miss,
            None => is_origin_miss(status),
        }
    }

    pub async fn route(&self, request: &OriginRequest) -> Result<Routed> {
        let mut state = OriginState::TryPrimary;
        loop {
            match state {
                OriginState::TryPrimary => {
                    let response = self.primary.fetch(request).await?;
                    if self.is_miss(response.status) {
                        tracing::debug!("Origin miss for {}, falling back", request.path);
                        state = OriginState::Fallback;
                        continue;
                    }
                    return Ok(Routed { state, response });
                }
                OriginState::Fallback => {
                    let response = self.fallback.fetch(request).await?;
                    return Ok(Routed { state, response });
                }
            }
        }
    }
}

/// The edge in front of the origin group: answers from its own cache when it
/// can, otherwise routes through the coordinator and caches 2xx responses
/// for as long as the cache policy allows.
pub struct EdgeService {
    coordinator: OriginFallbackCoordinator,
    cache: Arc<ObjectStore>,
    policy: CachePolicy,
}

impl EdgeService {
    pub fn new(coordinator: OriginFallbackCoordinator, cache: Arc<ObjectStore>, policy: CachePolicy) -> Self {
        Self { coordinator, cache, policy }
    }

    pub async fn serve(&self, request: &OriginRequest) -> Response {
        let key = cache_key(&request.path, request.query.as_deref(), &self.policy.query_strings);

        match self.cache.get(&key) {
            Ok(Some(obj)) => {
                tracing::info!("Edge cache hit for {}", request.path);
                return cached_response(obj);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Edge cache read failed for {}: {}", request.path, e),
        }

        let routed = match self.coordinator.route(request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Origin request failed for {}: {}", request.path, e);
                return (e.status_code(), format!("{}: {}", e.message(), e)).into_response();
            }
        };

        let OriginResponse { status, headers, body } = routed.response;
        let source = match routed.state {
            OriginState::TryPrimary => "Miss",
            OriginState::Fallback => "Fallback",
        };
        tracing::info!("Served {} from {} with status {}", request.path, source, status);

        if status.is_success() {
            let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
            let cache_control = headers.get(header::CACHE_CONTROL).and_then(|v| v.to_str().ok());
            let ttl = ttl_for(cache_control, &self.policy);
            if !ttl.is_zero() {
                if let Err(e) = self.cache.put(&key, &body, content_type, cache_control, ttl) {
                    tracing::warn!("Failed to cache {} at the edge: {}", request.path, e);
                }
            }
        }

        let mut response = (status, headers, body).into_response();
        response
            .headers_mut()
            .insert(HeaderName::from_static(policy::X_CACHE), HeaderValue::from_static(source));
        response
    }
}

fn cached_response(obj: StoredObject) -> Response {
    let mut headers = HeaderMap::new();
    let meta = &obj.metadata;
    if let Some(v) = meta.content_type.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    if let Some(v) = meta.cache_control.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(header::CACHE_CONTROL, v);
    }
    headers.insert(HeaderName::from_static(policy::X_CACHE), HeaderValue::from_static("Hit"));
    (StatusCode::OK, headers, obj.bytes).into_response()
}
