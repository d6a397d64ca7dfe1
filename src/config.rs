use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Cache-Control value attached to every image served by the fallback.
pub const DEFAULT_CACHE_CONTROL: &str = "max-age=31622400";
/// Directory service queried for validator pictures.
pub const DEFAULT_DIRECTORY_URL: &str = "https://keybase.io";
/// Bucket name used when none is configured.
pub const DEFAULT_BUCKET: &str = "validator-images";
/// Status the primary store answers with when an object is absent.
pub const DEFAULT_ORIGIN_MISS_STATUS: u16 = 403;

/// Which parts of the viewer query string take part in the edge cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStringBehavior {
    All,
    None,
    AllowList(Vec<String>),
}

impl QueryStringBehavior {
    /// Parses `all`, `none` or `allow:a,b,c`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "all" => return Some(Self::All),
            "none" => return Some(Self::None),
            _ => {}
        }
        let names = raw.strip_prefix("allow:")?;
        let names: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() { None } else { Some(Self::AllowList(names)) }
    }

    pub fn includes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::AllowList(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub min_ttl: Duration,
    pub query_strings: QueryStringBehavior,
    /// Static directive sent with every fallback success.
    pub cache_control: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            max_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            min_ttl: Duration::ZERO,
            query_strings: QueryStringBehavior::All,
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Base URL of the fallback entry point, e.g. `http://127.0.0.1:8080`.
    pub fallback_url: String,
    pub origin_miss_status: u16,
    pub cors_enabled: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            fallback_url: "http://127.0.0.1:8080".to_string(),
            origin_miss_status: DEFAULT_ORIGIN_MISS_STATUS,
            cors_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorImageConfig {
    /// Shared secret the edge injects as `x-origin-secret-header`.
    pub secret: String,
    pub images_bucket: String,
    pub store_dir: PathBuf,
    pub cache_policy: CachePolicy,
    pub directory_url: String,
    /// Budget covering the directory lookup and the image fetch together.
    pub request_timeout: Duration,
    pub max_image_size: usize, // bytes
    pub store_expiration: Duration,
    pub write_back: bool,
    pub edge: EdgeConfig,
}

impl Default for ValidatorImageConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            images_bucket: DEFAULT_BUCKET.to_string(),
            store_dir: PathBuf::from("./store"),
            cache_policy: CachePolicy::default(),
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            request_timeout: Duration::from_secs(5),
            max_image_size: 8 * 1024 * 1024,
            store_expiration: Duration::from_secs(90 * 24 * 60 * 60),
            write_back: false,
            edge: EdgeConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Secret cannot be empty")] EmptySecret,
    #[error("Images bucket cannot be empty")] EmptyBucket,
    #[error("Max image size must be > 0")] InvalidMaxSize,
    #[error("Request timeout must be > 0")] InvalidTimeout,
    #[error("TTLs must satisfy min <= default <= max")] InvalidTtlRange,
    #[error("Cache-Control is not a valid header value: {0}")] InvalidCacheControl(String),
    #[error("Invalid value for {key}: {value}")] InvalidValue { key: &'static str, value: String },
}

impl ValidatorImageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.trim().is_empty() { return Err(ConfigError::EmptySecret); }
        if self.images_bucket.trim().is_empty() { return Err(ConfigError::EmptyBucket); }
        if self.max_image_size == 0 { return Err(ConfigError::InvalidMaxSize); }
        if self.request_timeout.is_zero() { return Err(ConfigError::InvalidTimeout); }
        let p = &self.cache_policy;
        if p.min_ttl > p.default_ttl || p.default_ttl > p.max_ttl {
            return Err(ConfigError::InvalidTtlRange);
        }
        if axum::http::HeaderValue::from_str(&p.cache_control).is_err() {
            return Err(ConfigError::InvalidCacheControl(p.cache_control.clone()));
        }
        if !(100..=599).contains(&self.edge.origin_miss_status) {
            return Err(ConfigError::InvalidValue {
                key: "VALIDATOR_IMAGE_ORIGIN_MISS_STATUS",
                value: self.edge.origin_miss_status.to_string(),
            });
        }
        Ok(())
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, falling back to
    /// defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("VALIDATOR_IMAGE_SECRET") { cfg.secret = v; }
        if let Some(v) = lookup("VALIDATOR_IMAGE_BUCKET") { cfg.images_bucket = v; }
        if let Some(v) = lookup("VALIDATOR_IMAGE_STORE_DIR") { cfg.store_dir = PathBuf::from(v); }
        if let Some(v) = lookup("VALIDATOR_IMAGE_CACHE_CONTROL") { cfg.cache_policy.cache_control = v; }
        if let Some(v) = lookup("VALIDATOR_IMAGE_DIRECTORY_URL") {
            cfg.directory_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_TIMEOUT_SECS") {
            cfg.request_timeout = Duration::from_secs(parse_num("VALIDATOR_IMAGE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_MAX_SIZE") {
            cfg.max_image_size = parse_num("VALIDATOR_IMAGE_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_STORE_EXPIRATION_DAYS") {
            let days: u64 = parse_num("VALIDATOR_IMAGE_STORE_EXPIRATION_DAYS", &v)?;
            cfg.store_expiration = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_WRITE_BACK") {
            cfg.write_back = parse_bool("VALIDATOR_IMAGE_WRITE_BACK", &v)?;
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_FALLBACK_URL") {
            cfg.edge.fallback_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_ORIGIN_MISS_STATUS") {
            cfg.edge.origin_miss_status = parse_num("VALIDATOR_IMAGE_ORIGIN_MISS_STATUS", &v)?;
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_CORS") {
            cfg.edge.cors_enabled = parse_bool("VALIDATOR_IMAGE_CORS", &v)?;
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_QUERY_STRINGS") {
            cfg.cache_policy.query_strings = QueryStringBehavior::parse(&v).ok_or(
                ConfigError::InvalidValue { key: "VALIDATOR_IMAGE_QUERY_STRINGS", value: v.clone() },
            )?;
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_DEFAULT_TTL_SECS") {
            cfg.cache_policy.default_ttl = Duration::from_secs(parse_num("VALIDATOR_IMAGE_DEFAULT_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_MIN_TTL_SECS") {
            cfg.cache_policy.min_ttl = Duration::from_secs(parse_num("VALIDATOR_IMAGE_MIN_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("VALIDATOR_IMAGE_MAX_TTL_SECS") {
            cfg.cache_policy.max_ttl = Duration::from_secs(parse_num("VALIDATOR_IMAGE_MAX_TTL_SECS", &v)?);
        }

        Ok(cfg)
    }

    /// Short digest of the secret, safe to put in logs.
    pub fn secret_fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.secret.as_bytes());
        hex::encode(&digest[..6])
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value: raw.to_string() }),
    }
}
