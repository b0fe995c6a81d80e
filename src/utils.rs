//! # Utility Functions
//!
//! Identifier generation, `Location` URL composition and path parsing for
//! the resumable upload protocol, plus the shared CORS header set.
//!
//! The `Location` returned by a pre-request and the session segment parsed
//! from upload URLs are wire-contract details the mobile clients rely on
//! verbatim: the session id travels wrapped in literal parentheses and the
//! URL always carries a trailing slash.

use crate::constants::{CORS_ALLOW_HEADERS, CORS_ALLOW_METHODS, CORS_ALLOW_ORIGIN};
use uuid::Uuid;
use worker::{Headers, Url};

/// Generates the opaque identifier naming a blob pair in the object store.
pub fn generate_upload_identifier() -> String {
    Uuid::new_v4().to_string()
}

/// Generates the opaque identifier for a fresh upload session.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a request id for log correlation.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Composes the `Location` URL a successful pre-request replies with.
///
/// Takes the incoming request URL, strips a trailing
/// `?uploadType=resumable` query, substitutes the scheme with the
/// `X-Forwarded-Proto` value when a reverse proxy supplied one, and
/// appends the session segment `/(<sessionId>)/`.
pub fn location_url(url: &Url, forwarded_proto: Option<&str>, session_id: &str) -> String {
    let mut base = url.to_string();
    if let Some(stripped) = base.strip_suffix("?uploadType=resumable") {
        base = stripped.to_string();
    }
    if let Some(proto) = forwarded_proto {
        if let Some((_, rest)) = base.split_once("://") {
            base = format!("{}://{}", proto, rest);
        }
    }
    format!("{}/({})/", base.trim_end_matches('/'), session_id)
}

/// Extracts the session id from an upload URL path.
///
/// The last path segment must be `(<sessionId>)`, with or without the
/// trailing slash the `Location` URL carries.
pub fn session_id_from_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next()?;
    let inner = segment.strip_prefix('(')?.strip_suffix(')')?;
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Creates the CORS header set applied to every API response.
///
/// The allow-list covers the upload protocol's own headers next to the
/// metadata header names the capture clients send on chunk uploads.
pub fn cors_headers() -> Headers {
    let headers = Headers::new();
    // Note: These values are known to be valid
    let _ = headers.set("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN);
    let _ = headers.set("Access-Control-Allow-Methods", CORS_ALLOW_METHODS);
    let _ = headers.set("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_appends_parenthesized_session_segment() {
        let url = Url::parse("http://localhost:8080/api/v3/measurements").unwrap();
        assert_eq!(
            location_url(&url, None, "4886f24a"),
            "http://localhost:8080/api/v3/measurements/(4886f24a)/"
        );
    }

    #[test]
    fn location_strips_resumable_upload_type_query() {
        let url =
            Url::parse("http://localhost:8080/api/v3/measurements?uploadType=resumable").unwrap();
        assert_eq!(
            location_url(&url, None, "4886f24a"),
            "http://localhost:8080/api/v3/measurements/(4886f24a)/"
        );
    }

    #[test]
    fn location_substitutes_forwarded_proto() {
        let url = Url::parse("http://collector.example.com/api/v3/measurements").unwrap();
        assert_eq!(
            location_url(&url, Some("https"), "4886f24a"),
            "https://collector.example.com/api/v3/measurements/(4886f24a)/"
        );
    }

    #[test]
    fn session_id_is_parsed_from_upload_paths() {
        assert_eq!(
            session_id_from_path("/api/v3/measurements/(4886f24a)/"),
            Some("4886f24a".to_string())
        );
        assert_eq!(
            session_id_from_path("/api/v3/measurements/(4886f24a)"),
            Some("4886f24a".to_string())
        );
    }

    #[test]
    fn malformed_session_segments_are_rejected() {
        assert_eq!(session_id_from_path("/api/v3/measurements/4886f24a/"), None);
        assert_eq!(session_id_from_path("/api/v3/measurements/()/"), None);
        assert_eq!(session_id_from_path("/api/v3/measurements/"), None);
    }
}
