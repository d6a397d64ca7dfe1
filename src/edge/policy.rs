use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::{CachePolicy, QueryStringBehavior};

/// Marks responses that went through this edge layer.
pub const DELIVERY_HEADER: &str = "x-validator-image";
pub const DELIVERY_VERSION: &str = "v1.0";
/// Where the body came from: `Hit` (edge cache), `Miss` (primary store) or
/// `Fallback`.
pub const X_CACHE: &str = "x-cache";

/// Edge cache key over the path and the query parameters the policy keeps.
/// Parameters are sorted so their order in the URL does not matter.
pub fn cache_key(path: &str, query: Option<&str>, behavior: &QueryStringBehavior) -> String {
    let mut params: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| behavior.includes(p.split('=').next().unwrap_or("")))
        .collect();
    params.sort_unstable();

    let canonical = format!("{}?{}", path, params.join("&"));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// How long the edge keeps a response, given the origin's Cache-Control.
///
/// `s-maxage` wins over `max-age`; either is clamped to `[min_ttl, max_ttl]`.
/// `no-store`, `no-cache` and `private` drop to `min_ttl`. Without a usable
/// directive the policy's `default_ttl` applies.
pub fn ttl_for(cache_control: Option<&str>, policy: &CachePolicy) -> Duration {
    let Some(value) = cache_control else {
        return policy.default_ttl;
    };

    let mut max_age = None;
    let mut s_maxage = None;
    for directive in value.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        match directive.as_str() {
            "no-store" | "no-cache" | "private" => return policy.min_ttl,
            _ => {}
        }
        if let Some((name, secs)) = directive.split_once('=') {
            let secs = secs.trim().trim_matches('"').parse::<u64>().ok();
            match name.trim() {
                "max-age" => max_age = secs,
                "s-maxage" => s_maxage = secs,
                _ => {}
            }
        }
    }

    match s_maxage.or(max_age) {
        Some(secs) => Duration::from_secs(secs).min(policy.max_ttl).max(policy.min_ttl),
        None => policy.default_ttl,
    }
}

/// Response headers policy: CORS open to every origin for GET, plus the
/// delivery marker. Applied to every response the edge returns.
pub async fn response_headers_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    headers.insert(HeaderName::from_static(DELIVERY_HEADER), HeaderValue::from_static(DELIVERY_VERSION));
    headers.insert(header::VARY, HeaderValue::from_static("accept"));

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 24 * 60 * 60;

    #[test]
    fn ttl_uses_max_age() {
        let policy = CachePolicy::default();
        assert_eq!(ttl_for(Some("max-age=3600"), &policy), Duration::from_secs(3600));
    }

    #[test]
    fn ttl_is_clamped_to_max() {
        let policy = CachePolicy::default();
        // 366 days asks for more than the 365 day ceiling
        assert_eq!(
            ttl_for(Some("max-age=31622400"), &policy),
            Duration::from_secs(365 * DAY)
        );
    }

    #[test]
    fn ttl_is_clamped_to_min() {
        let policy = CachePolicy { min_ttl: Duration::from_secs(60), ..CachePolicy::default() };
        assert_eq!(ttl_for(Some("max-age=5"), &policy), Duration::from_secs(60));
    }

    #[test]
    fn s_maxage_wins() {
        let policy = CachePolicy::default();
        assert_eq!(
            ttl_for(Some("public, max-age=10, s-maxage=20"), &policy),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn no_store_uses_min_ttl() {
        let policy = CachePolicy::default();
        assert_eq!(ttl_for(Some("no-store"), &policy), Duration::ZERO);
        assert_eq!(ttl_for(Some("private, max-age=600"), &policy), Duration::ZERO);
    }

    #[test]
    fn absent_or_unparsable_uses_default() {
        let policy = CachePolicy::default();
        assert_eq!(ttl_for(None, &policy), Duration::from_secs(DAY));
        assert_eq!(ttl_for(Some("public"), &policy), Duration::from_secs(DAY));
        assert_eq!(ttl_for(Some("max-age=soon"), &policy), Duration::from_secs(DAY));
    }

    #[test]
    fn cache_key_ignores_param_order() {
        let all = QueryStringBehavior::All;
        assert_eq!(
            cache_key("/v/abc", Some("a=1&b=2"), &all),
            cache_key("/v/abc", Some("b=2&a=1"), &all)
        );
        assert_ne!(cache_key("/v/abc", Some("a=1"), &all), cache_key("/v/abc", None, &all));
    }

    #[test]
    fn cache_key_respects_behavior() {
        let none = QueryStringBehavior::None;
        assert_eq!(cache_key("/v/abc", Some("a=1"), &none), cache_key("/v/abc", None, &none));

        let allow = QueryStringBehavior::AllowList(vec!["v".into()]);
        assert_eq!(
            cache_key("/v/abc", Some("v=2&junk=x"), &allow),
            cache_key("/v/abc", Some("v=2"), &allow)
        );
        assert_ne!(
            cache_key("/v/abc", Some("v=2"), &allow),
            cache_key("/v/abc", Some("v=3"), &allow)
        );
    }
}
