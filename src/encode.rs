use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::fetch::FetchedImage;
use crate::ValidatorImageError;

/// Response produced by the fallback, in the shape an invocation-style
/// transport expects. The body is text; when `is_base64_encoded` is set the
/// transport must decode it before handing bytes to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl ProtocolResponse {
    /// Success response carrying the image. Exactly two headers are set;
    /// an absent content type is passed on as an empty value.
    pub fn image(image: &FetchedImage, cache_control: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            header::CONTENT_TYPE.as_str().to_string(),
            image.content_type.clone().unwrap_or_default(),
        );
        headers.insert(header::CACHE_CONTROL.as_str().to_string(), cache_control.to_string());

        Self {
            status_code: StatusCode::OK.as_u16(),
            headers,
            body: STANDARD.encode(&image.bytes),
            is_base64_encoded: true,
        }
    }

    /// Plain-text error response: `"<message>: <detail>"`, never image bytes.
    pub fn error(err: &ValidatorImageError) -> Self {
        Self {
            status_code: err.status_code().as_u16(),
            headers: BTreeMap::new(),
            body: format!("{}: {}", err.message(), err),
            is_base64_encoded: false,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Raw body bytes, decoding base64 when flagged.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.is_base64_encoded {
            STANDARD.decode(&self.body)
        } else {
            Ok(self.body.clone().into_bytes())
        }
    }
}

// Plays the role of the function URL in front of the fallback: the base64
// body is turned back into bytes before it goes on the wire.
impl IntoResponse for ProtocolResponse {
    fn into_response(self) -> Response {
        let bytes = match self.body_bytes() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Undecodable response body: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid response body").into_response();
            }
        };

        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::builder().status(status);

        if let Some(h) = response.headers_mut() {
            for (name, value) in &self.headers {
                if value.is_empty() {
                    continue;
                }
                match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
                    (Ok(n), Ok(v)) => { h.insert(n, v); }
                    _ => tracing::warn!("Dropping invalid response header {}", name),
                }
            }
            if !self.is_base64_encoded && !h.contains_key(header::CONTENT_TYPE) {
                h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
            }
        }

        response
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn jpeg() -> FetchedImage {
        FetchedImage {
            bytes: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0x00, 0x10]),
            content_type: Some("image/jpeg".into()),
        }
    }

    #[test]
    fn image_response_has_two_headers_and_base64_body() {
        let resp = ProtocolResponse::image(&jpeg(), "max-age=31622400");
        assert_eq!(resp.status_code, 200);
        assert!(resp.is_base64_encoded);
        assert_eq!(resp.headers.len(), 2);
        assert_eq!(resp.header("Content-Type"), Some("image/jpeg"));
        assert_eq!(resp.header("cache-control"), Some("max-age=31622400"));
        assert_eq!(resp.body, "/9j/ABA=");
        assert_eq!(resp.body_bytes().unwrap(), vec![0xFF, 0xD8, 0xFF, 0x00, 0x10]);
    }

    #[test]
    fn missing_content_type_becomes_empty() {
        let img = FetchedImage { content_type: None, ..jpeg() };
        let resp = ProtocolResponse::image(&img, "max-age=1");
        assert_eq!(resp.header("content-type"), Some(""));
        assert_eq!(resp.headers.len(), 2);
    }

    #[test]
    fn error_response_is_plain_text() {
        let err = ValidatorImageError::ResolutionNotFound("no primary picture URL detected".into());
        let resp = ProtocolResponse::error(&err);
        assert_eq!(resp.status_code, 500);
        assert!(!resp.is_base64_encoded);
        assert!(resp.headers.is_empty());
        assert!(resp.body.starts_with("error downloading original image"));
        assert!(resp.body.contains("no primary picture URL detected"));
    }

    #[test]
    fn serializes_in_invocation_shape() {
        let resp = ProtocolResponse::image(&jpeg(), "max-age=1");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["isBase64Encoded"], true);
        assert_eq!(json["headers"]["content-type"], "image/jpeg");
    }
}
