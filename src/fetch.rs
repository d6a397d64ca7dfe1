use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;

use crate::resolve::ResolvedImageLocation;
use crate::ValidatorImageError;

/// Image bytes and the `Content-Type` the host reported for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait::async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Downloads the image a resolver pointed at.
    ///
    /// # Parameters
    /// * `location` - Absolute picture URL returned by the resolver
    ///
    /// # Returns
    /// The body bytes and the upstream `Content-Type`, if one was sent
    ///
    /// # Errors
    /// Returns `ValidatorImageError::FetchError` if:
    /// - The request cannot be sent or the body cannot be read
    /// - The upstream answers with a non-2xx status
    /// - The image is larger than the configured size limit
    async fn fetch(&self, location: &ResolvedImageLocation) -> Result<FetchedImage, ValidatorImageError>;
}

/// Downloads the picture over HTTP.
///
/// The body is read fully into memory, bounded by `max_size`. The limit is
/// checked against `Content-Length` up front and again while streaming, so a
/// lying header cannot push past it.
///
/// `Content-Type` is captured verbatim. A missing header is not an error.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    max_size: usize,
}

impl HttpImageFetcher {
    pub fn new(client: Client, max_size: usize) -> Self {
        Self { client, max_size }
    }
}

#[async_trait::async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, location: &ResolvedImageLocation) -> Result<FetchedImage, ValidatorImageError> {
        let resp = self
            .client
            .get(&location.url)
            .send()
            .await
            .map_err(|e| ValidatorImageError::FetchError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ValidatorImageError::FetchError(format!(
                "Upstream status: {}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(len) = resp.content_length() {
            if len > self.max_size as u64 {
                return Err(ValidatorImageError::FetchError(format!(
                    "Image exceeds size limit of {} bytes",
                    self.max_size
                )));
            }
        }

        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| ValidatorImageError::FetchError(e.to_string()))?
        {
            if buf.len() + chunk.len() > self.max_size {
                return Err(ValidatorImageError::FetchError(format!(
                    "Image exceeds size limit of {} bytes",
                    self.max_size
                )));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchedImage { bytes: buf.freeze(), content_type })
    }
}
