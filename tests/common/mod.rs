#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use validator_image::config::ValidatorImageConfig;
use validator_image::fetch::{FetchedImage, ImageFetcher};
use validator_image::resolve::{IdentifierResolver, ResolvedImageLocation};
use validator_image::ValidatorImageError;

pub const SECRET: &str = "test-origin-secret";
pub const IDENTIFIER: &str = "30E6CD38D9721222";
pub const IMAGE_URL: &str = "https://example/img.jpg";
pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

pub fn test_config() -> ValidatorImageConfig {
    ValidatorImageConfig {
        secret: SECRET.to_string(),
        ..Default::default()
    }
}

/// Resolver returning a fixed answer and counting calls.
pub struct StubResolver {
    calls: AtomicUsize,
    url: Option<String>,
    delay: Duration,
}

impl StubResolver {
    pub fn found(url: &str) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), url: Some(url.to_string()), delay: Duration::ZERO })
    }

    pub fn not_found() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), url: None, delay: Duration::ZERO })
    }

    pub fn slow(url: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), url: Some(url.to_string()), delay })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentifierResolver for StubResolver {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedImageLocation, ValidatorImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.url {
            Some(url) => Ok(ResolvedImageLocation { url: url.clone() }),
            None => Err(ValidatorImageError::ResolutionNotFound(format!(
                "no primary picture URL detected for {}",
                identifier
            ))),
        }
    }
}

/// Fetcher returning a fixed image or error and counting calls.
pub struct StubFetcher {
    calls: AtomicUsize,
    outcome: Result<FetchedImage, String>,
    delay: Duration,
}

impl StubFetcher {
    pub fn image(bytes: &'static [u8], content_type: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome: Ok(FetchedImage {
                bytes: Bytes::from_static(bytes),
                content_type: content_type.map(str::to_string),
            }),
            delay: Duration::ZERO,
        })
    }

    pub fn failing(detail: &str) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), outcome: Err(detail.to_string()), delay: Duration::ZERO })
    }

    pub fn slow(bytes: &'static [u8], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome: Ok(FetchedImage { bytes: Bytes::from_static(bytes), content_type: Some("image/jpeg".into()) }),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, _location: &ResolvedImageLocation) -> Result<FetchedImage, ValidatorImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone().map_err(ValidatorImageError::FetchError)
    }
}

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_secret(uri: &str, secret: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-origin-secret-header", secret)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
}
