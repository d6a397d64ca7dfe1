use axum::http::{HeaderMap, Method};
use subtle::ConstantTimeEq;

use crate::ValidatorImageError;

/// Header the edge layer injects on every request it forwards to the fallback.
pub const ORIGIN_SECRET_HEADER: &str = "x-origin-secret-header";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("missing origin secret")] Missing,
    #[error("invalid origin secret")] Invalid,
}

// Length is compared in constant time too, so a short guess is not
// distinguishable from a wrong guess of the right length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a);
    b_padded[..b.len()].copy_from_slice(b);

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}

pub fn verify_secret(presented: Option<&str>, expected: &str) -> Result<(), SecretError> {
    let presented = match presented {
        Some(p) if !p.is_empty() => p,
        _ => return Err(SecretError::Missing),
    };
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(SecretError::Invalid)
    }
}

/// Checks the preconditions of a fallback request: the verb first, then the
/// origin secret. Nothing downstream runs unless both pass.
#[derive(Debug, Clone)]
pub struct SecretValidator {
    expected: String,
}

impl SecretValidator {
    pub fn new(expected: impl Into<String>) -> Self {
        Self { expected: expected.into() }
    }

    pub fn check(&self, method: &Method, presented: Option<&str>) -> Result<(), ValidatorImageError> {
        if *method != Method::GET {
            return Err(ValidatorImageError::MethodNotAllowed(method.to_string()));
        }
        verify_secret(presented, &self.expected)
            .map_err(|e| ValidatorImageError::Unauthorized(e.to_string()))
    }
}

/// Reads the origin secret header, treating non-UTF-8 values as absent.
pub fn secret_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN_SECRET_HEADER).and_then(|v| v.to_str().ok())
}
