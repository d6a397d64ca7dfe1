use reqwest::Client;
use serde::Deserialize;

use crate::ValidatorImageError;

/// Path of the directory lookup endpoint, relative to the directory host.
pub const LOOKUP_PATH: &str = "/_/api/1.0/user/lookup.json";

/// Location of a validator picture as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImageLocation {
    pub url: String,
}

// {"status":{"code":0,"name":"OK"},"them":[{"id":"…","pictures":{"primary":{"url":"https://…","source":null}}}]}
#[derive(Debug, Deserialize)]
pub struct LookupResponse {
    #[serde(default)]
    pub them: Option<Vec<Option<LookupEntity>>>,
}

#[derive(Debug, Deserialize)]
pub struct LookupEntity {
    #[serde(default)]
    pub pictures: Option<Pictures>,
}

#[derive(Debug, Deserialize)]
pub struct Pictures {
    #[serde(default)]
    pub primary: Option<Picture>,
}

#[derive(Debug, Deserialize)]
pub struct Picture {
    #[serde(default)]
    pub url: Option<String>,
}

impl LookupResponse {
    /// Primary picture of the first matching entity. Later matches are ignored.
    pub fn primary_picture(&self) -> Option<ResolvedImageLocation> {
        let first = self.them.as_ref()?.first()?.as_ref()?;
        let url = first.pictures.as_ref()?.primary.as_ref()?.url.as_ref()?;
        if url.is_empty() {
            return None;
        }
        Some(ResolvedImageLocation { url: url.clone() })
    }
}

/// Maps an external identifier to the URL of its picture.
#[async_trait::async_trait]
pub trait IdentifierResolver: Send + Sync {
    /// Looks up the primary picture for `identifier`.
    ///
    /// Only the first matched entity is considered.
    ///
    /// # Parameters
    /// * `identifier` - Key suffix taken from the last request path segment
    ///
    /// # Returns
    /// The picture URL of the first match
    ///
    /// # Errors
    /// - `ResolutionNotFound` when nothing matches or the match has no picture URL
    /// - `ResolutionTransportError` when the directory is unreachable, answers
    ///   non-2xx, or returns a body that does not parse
    async fn resolve(&self, identifier: &str) -> Result<ResolvedImageLocation, ValidatorImageError>;
}

/// Resolver backed by the Keybase user lookup API.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    client: Client,
    base_url: String,
}

impl DirectoryResolver {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    pub fn lookup_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), LOOKUP_PATH)
    }
}

#[async_trait::async_trait]
impl IdentifierResolver for DirectoryResolver {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedImageLocation, ValidatorImageError> {
        let url = self.lookup_url();
        tracing::debug!("Directory lookup for key_suffix={} at {}", identifier, url);

        let resp = self
            .client
            .get(&url)
            .query(&[("fields", "pictures"), ("key_suffix", identifier)])
            .send()
            .await
            .map_err(|e| ValidatorImageError::ResolutionTransportError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ValidatorImageError::ResolutionTransportError(format!(
                "Directory status: {}",
                resp.status()
            )));
        }

        let body: LookupResponse = resp
            .json()
            .await
            .map_err(|e| ValidatorImageError::ResolutionTransportError(e.to_string()))?;

        body.primary_picture().ok_or_else(|| {
            ValidatorImageError::ResolutionNotFound(format!(
                "no primary picture URL detected for {}",
                identifier
            ))
        })
    }
}
