use axum::http::{HeaderMap, Method};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use crate::config::ValidatorImageConfig;
use crate::encode::ProtocolResponse;
use crate::fetch::{FetchedImage, ImageFetcher};
use crate::resolve::IdentifierResolver;
use crate::secret::{secret_from_headers, SecretValidator, ORIGIN_SECRET_HEADER};
use crate::store::object_key;
use crate::writeback::{NoopWriteBack, WriteBack};
use crate::{Result, ValidatorImageError};

/// One inbound fallback request.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub secret: Option<String>,
}

impl ImageRequest {
    pub fn new(method: Method, path: &str, secret: Option<String>) -> Self {
        Self {
            method,
            segments: path.split('/').map(str::to_string).collect(),
            secret,
        }
    }

    pub fn from_parts(method: Method, path: &str, headers: &HeaderMap) -> Self {
        Self::new(method, path, secret_from_headers(headers).map(str::to_string))
    }

    /// The last path segment, percent-decoded. May be empty, e.g. for
    /// `/validator/`. A segment that does not decode to UTF-8 is used raw.
    pub fn identifier(&self) -> Cow<'_, str> {
        let raw = self.segments.last().map(String::as_str).unwrap_or("");
        urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
    }

    /// Object key the image would live under in the primary store.
    pub fn object_key(&self) -> String {
        object_key(&self.segments.join("/"))
    }
}

/// Invocation event delivered by a function-style transport, e.g.
/// `{"requestContext":{"http":{"method":"GET","path":"/v/ABC"}},"headers":{…}}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    #[serde(default)]
    pub request_context: Option<RequestContext>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub http: Option<HttpContext>,
}

#[derive(Debug, Deserialize)]
pub struct HttpContext {
    pub method: String,
    #[serde(default)]
    pub path: String,
}

impl InvocationEvent {
    /// An event without a usable HTTP method is rejected like any other
    /// non-GET request.
    pub fn into_request(self) -> Result<ImageRequest> {
        let http = self
            .request_context
            .and_then(|c| c.http)
            .ok_or_else(|| ValidatorImageError::MethodNotAllowed("missing request context".into()))?;

        let method = Method::from_bytes(http.method.as_bytes())
            .map_err(|_| ValidatorImageError::MethodNotAllowed(http.method.clone()))?;

        let secret = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(ORIGIN_SECRET_HEADER))
            .map(|(_, v)| v.clone());

        Ok(ImageRequest::new(method, &http.path, secret))
    }
}

/// The authenticated fallback path: validate, resolve, fetch, encode.
///
/// Holds no per-request state; every call is independent.
#[derive(Clone)]
pub struct FallbackService {
    validator: SecretValidator,
    resolver: Arc<dyn IdentifierResolver>,
    fetcher: Arc<dyn ImageFetcher>,
    write_back: Arc<dyn WriteBack>,
    cache_control: String,
    request_timeout: Duration,
}

impl FallbackService {
    pub fn new(
        config: &ValidatorImageConfig,
        resolver: Arc<dyn IdentifierResolver>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            validator: SecretValidator::new(config.secret.clone()),
            resolver,
            fetcher,
            write_back: Arc::new(NoopWriteBack),
            cache_control: config.cache_policy.cache_control.clone(),
            request_timeout: config.request_timeout,
        }
    }

    pub fn with_write_back(mut self, write_back: Arc<dyn WriteBack>) -> Self {
        self.write_back = write_back;
        self
    }

    /// Runs one request through the pipeline.
    ///
    /// The method is checked before the secret, and both before any outbound
    /// call. Resolution and fetch share a single `request_timeout` deadline.
    ///
    /// # Parameters
    /// * `request` - Method, path segments and secret header of the request
    ///
    /// # Returns
    /// An image envelope (`200`, base64 body) or an error envelope. Failures
    /// are logged here and never escape as `Err`:
    /// - `400` for a non-GET method
    /// - `403` for a missing or wrong secret
    /// - `500` when resolution or fetch fails or the deadline passes
    pub async fn handle(&self, request: &ImageRequest) -> ProtocolResponse {
        match self.process(request).await {
            Ok(resp) => resp,
            Err(e) => {
                match &e {
                    ValidatorImageError::Unauthorized(_) | ValidatorImageError::MethodNotAllowed(_) => {
                        tracing::warn!("Rejected fallback request: {}: {}", e.message(), e)
                    }
                    _ => tracing::error!(
                        "Fallback failed for identifier={}: {}: {}",
                        request.identifier(),
                        e.message(),
                        e
                    ),
                }
                ProtocolResponse::error(&e)
            }
        }
    }

    async fn process(&self, request: &ImageRequest) -> Result<ProtocolResponse> {
        self.validator.check(&request.method, request.secret.as_deref())?;

        let identifier = request.identifier();
        tracing::debug!("Resolving validator image for identifier={}", identifier);

        // One deadline for both calls; they run strictly one after the other.
        let deadline = Instant::now() + self.request_timeout;

        let location = timeout_at(deadline, self.resolver.resolve(&identifier))
            .await
            .map_err(|_| {
                ValidatorImageError::ResolutionTransportError(format!(
                    "directory lookup timed out after {:?}",
                    self.request_timeout
                ))
            })??;

        tracing::debug!("Fetching {} for identifier={}", location.url, identifier);

        let image = timeout_at(deadline, self.fetcher.fetch(&location))
            .await
            .map_err(|_| {
                ValidatorImageError::FetchError(format!(
                    "image fetch timed out after {:?}",
                    self.request_timeout
                ))
            })??;

        tracing::info!(
            "Fetched {} bytes ({}) for identifier={}",
            image.bytes.len(),
            image.content_type.as_deref().unwrap_or("no content type"),
            identifier
        );

        let response = ProtocolResponse::image(&image, &self.cache_control);
        self.spawn_write_back(request.object_key(), image);
        Ok(response)
    }

    fn spawn_write_back(&self, key: String, image: FetchedImage) {
        let hook = self.write_back.clone();
        tokio::spawn(async move {
            hook.write_back(&key, &image).await;
        });
    }
}
