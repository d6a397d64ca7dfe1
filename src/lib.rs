use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod edge;
pub mod encode;
pub mod fetch;
pub mod handler;
pub mod resolve;
pub mod secret;
pub mod store;
pub mod writeback;

use crate::config::ValidatorImageConfig;
use crate::edge::{
    response_headers_middleware, EdgeService, HttpFallbackOrigin, OriginFallbackCoordinator,
    OriginRequest, StoreOrigin,
};
use crate::encode::ProtocolResponse;
use crate::fetch::HttpImageFetcher;
use crate::handler::{FallbackService, ImageRequest, InvocationEvent};
use crate::resolve::DirectoryResolver;
use crate::store::ObjectStore;
use crate::writeback::StoreWriteBack;

/// Name of the sled tree holding the edge cache.
pub const EDGE_CACHE_TREE: &str = "edge-cache";

#[derive(Error, Debug)]
pub enum ValidatorImageError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("Resolution not found: {0}")]
    ResolutionNotFound(String),
    #[error("Resolution transport error: {0}")]
    ResolutionTransportError(String),
    #[error("Fetch error: {0}")]
    FetchError(String),
    #[error("Origin unreachable: {0}")]
    OriginUnreachable(String),
    #[error("Storage error: {0}")]
    StoreError(#[from] store::StoreError),
    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ValidatorImageError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed(_) => StatusCode::BAD_REQUEST,
            Self::ResolutionNotFound(_)
            | Self::ResolutionTransportError(_)
            | Self::FetchError(_)
            | Self::StoreError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::OriginUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Client-facing message placed in front of the error detail.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Request unauthorized",
            Self::MethodNotAllowed(_) => "Only GET method is supported",
            Self::ResolutionNotFound(_) | Self::ResolutionTransportError(_) | Self::FetchError(_) => {
                "error downloading original image"
            }
            Self::OriginUnreachable(_) => "error reaching origin",
            Self::StoreError(_) | Self::InternalError(_) => "internal error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ValidatorImageError>;

fn http_client(config: &ValidatorImageConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| ValidatorImageError::InternalError(e.to_string()))
}

/// Builds the fallback pipeline from configuration. `store` receives fetched
/// images when write-back is enabled.
pub fn fallback_service(
    config: &ValidatorImageConfig,
    store: Option<Arc<ObjectStore>>,
) -> Result<FallbackService> {
    let client = http_client(config)?;
    let resolver = Arc::new(DirectoryResolver::new(client.clone(), config.directory_url.clone()));
    let fetcher = Arc::new(HttpImageFetcher::new(client, config.max_image_size));
    let mut service = FallbackService::new(config, resolver, fetcher);

    match store {
        Some(store) if config.write_back => {
            tracing::info!("Write-back to primary store enabled");
            service = service.with_write_back(Arc::new(StoreWriteBack::new(
                store,
                config.cache_policy.cache_control.clone(),
                config.store_expiration,
            )));
        }
        _ => {}
    }
    Ok(service)
}

/// Builds the edge layer: `primary` is the object store tried first, `cache`
/// holds responses the edge has already served.
pub fn edge_service(
    config: &ValidatorImageConfig,
    primary: Arc<ObjectStore>,
    cache: Arc<ObjectStore>,
) -> Result<EdgeService> {
    let miss_status = StatusCode::from_u16(config.edge.origin_miss_status)
        .map_err(|e| ValidatorImageError::InternalError(e.to_string()))?;

    let fallback = HttpFallbackOrigin::new(
        http_client(config)?,
        config.edge.fallback_url.clone(),
        config.secret.clone(),
    );
    let primary = StoreOrigin::new(primary).with_miss_status(miss_status);
    let coordinator = OriginFallbackCoordinator::new(Arc::new(primary), Arc::new(fallback))
        .with_miss_status(miss_status);

    Ok(EdgeService::new(coordinator, cache, config.cache_policy.clone()))
}

async fn fallback_handler(
    State(service): State<Arc<FallbackService>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> ProtocolResponse {
    tracing::debug!("Fallback request: {} {}", method, uri.path());
    let request = ImageRequest::from_parts(method, uri.path(), &headers);
    service.handle(&request).await
}

/// Event transport. Whatever arrives here is answered with an envelope; a
/// request that is not a POSTed JSON event is rejected as a non-GET request.
async fn invoke_handler(
    State(service): State<Arc<FallbackService>>,
    method: Method,
    body: Bytes,
) -> Json<ProtocolResponse> {
    let request = if method != Method::POST {
        Err(ValidatorImageError::MethodNotAllowed(format!("{} /_invoke", method)))
    } else {
        serde_json::from_slice::<InvocationEvent>(&body)
            .map_err(|e| ValidatorImageError::MethodNotAllowed(format!("malformed invocation event: {}", e)))
            .and_then(InvocationEvent::into_request)
    };

    let response = match request {
        Ok(request) => service.handle(&request).await,
        Err(e) => {
            tracing::warn!("Rejected invocation event: {}", e);
            ProtocolResponse::error(&e)
        }
    };
    Json(response)
}

async fn edge_handler(State(service): State<Arc<EdgeService>>, uri: Uri) -> Response {
    let request = OriginRequest {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
    };
    service.serve(&request).await
}

async fn health_handler() -> impl IntoResponse {
    use serde_json::json;

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "validator-image"
    }))
}

/// Router for the fallback entry point. Every path is an image request; the
/// method and secret checks happen inside the pipeline, so any verb is routed.
pub fn fallback_router(service: FallbackService) -> Router {
    let state = Arc::new(service);

    Router::new()
        .route("/health", get(health_handler))
        .route("/_invoke", any(invoke_handler))
        .route("/", any(fallback_handler))
        .route("/*path", any(fallback_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Router for the edge layer that clients talk to.
pub fn edge_router(service: EdgeService, cors_enabled: bool) -> Router {
    let state = Arc::new(service);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/*path", get(edge_handler))
        .with_state(state);

    if cors_enabled {
        router = router.layer(middleware::from_fn(response_headers_middleware));
    } else {
        tracing::info!("Edge response headers policy disabled");
    }

    router.layer(TraceLayer::new_for_http())
}
