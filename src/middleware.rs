//! # Middleware Components
//!
//! Cross-cutting request processing for the measurement collector:
//! metadata and header validation, principal extraction and CORS.
//!
//! The validators are total functions over their inputs and perform no
//! I/O, so the whole protocol surface (content ranges, declared sizes,
//! metadata rules) is exercised by plain unit tests below.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use uuid::Uuid;
use worker::*;

use crate::constants::{
    DEVICE_ID_LENGTH, HEADER_UPLOAD_CONTENT_LENGTH, MAX_IDENTIFIER_LENGTH,
    MAX_METADATA_FIELD_LENGTH, MINIMUM_LOCATION_COUNT, SUPPORTED_FORMAT_VERSION,
};
use crate::errors::{AppError, AppResult};
use crate::models::{GeoLocation, MeasurementMetadata, MetadataFields};
use crate::utils::cors_headers;

/// An inclusive byte range announced by a chunk upload:
/// `Content-Range: bytes <from>-<to>/<total>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub from: u64,
    pub to: u64,
    pub total: u64,
}

/// Middleware for handling Cross-Origin Resource Sharing (CORS) requests.
pub struct CorsMiddleware;

impl CorsMiddleware {
    /// Adds the shared CORS header set to an existing response, keeping
    /// the protocol headers (`Location`, `Range`) it already carries.
    pub fn apply_headers(mut response: Response) -> Response {
        let headers = response.headers_mut();
        let _ = headers.set("Access-Control-Allow-Origin", crate::constants::CORS_ALLOW_ORIGIN);
        let _ = headers.set("Access-Control-Allow-Methods", crate::constants::CORS_ALLOW_METHODS);
        let _ = headers.set("Access-Control-Allow-Headers", crate::constants::CORS_ALLOW_HEADERS);
        response
    }

    /// Handles CORS preflight requests (OPTIONS method).
    pub fn handle_preflight() -> Result<Response> {
        Ok(Response::empty()?.with_headers(cors_headers()))
    }
}

/// The authenticated caller of a request.
///
/// The collector never issues or verifies credentials itself; the access
/// gateway in front of it does. All the upload pipeline consumes is a
/// stable user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// Extracts the authenticated principal from a request.
pub struct AuthMiddleware;

impl AuthMiddleware {
    /// Reads the principal from the `Authorization` header.
    ///
    /// Token signatures are verified by the gateway before a request
    /// reaches this worker; here only the stable subject claim is pulled
    /// out of the token payload.
    pub fn authenticate(req: &Request) -> AppResult<Principal> {
        let header = req
            .headers()
            .get("Authorization")
            .ok()
            .flatten()
            .ok_or_else(|| AppError::AuthError {
                message: "missing Authorization header".to_string(),
            })?;

        Self::principal_from_bearer(&header)
    }

    /// Parses a `Bearer <token>` header value into a [`Principal`].
    pub fn principal_from_bearer(value: &str) -> AppResult<Principal> {
        let token = value.strip_prefix("Bearer ").ok_or_else(|| AppError::AuthError {
            message: "Authorization header is not a bearer token".to_string(),
        })?;

        let payload = token.split('.').nth(1).ok_or_else(|| AppError::AuthError {
            message: "bearer token is not a JWT".to_string(),
        })?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AppError::AuthError {
                message: "token payload is not valid base64url".to_string(),
            })?;

        let claims: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|_| AppError::AuthError {
                message: "token payload is not valid JSON".to_string(),
            })?;

        let subject = claims
            .get("sub")
            .and_then(serde_json::Value::as_str)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AppError::AuthError {
                message: "token payload has no subject claim".to_string(),
            })?;

        Ok(Principal {
            user_id: subject.to_string(),
        })
    }
}

/// Middleware validating metadata and protocol headers.
///
/// All methods are pure; callers decide how the resulting errors surface
/// on the wire.
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    /// Validates raw wire metadata into a [`MeasurementMetadata`].
    ///
    /// Field presence, length caps, numeric ranges and the location-pair
    /// rule yield `InvalidMetadata`; uploads the server refuses as a
    /// matter of policy (too few locations, unsupported transfer format
    /// version) yield `SkipUpload`.
    pub fn validate_metadata(fields: &MetadataFields) -> AppResult<MeasurementMetadata> {
        let device_id = required(&fields.device_id, "deviceId")?;
        if device_id.len() != DEVICE_ID_LENGTH {
            return Err(invalid("deviceId", "must be 36 characters long"));
        }
        if Uuid::parse_str(&device_id).is_err() {
            return Err(invalid("deviceId", "must be a UUID"));
        }

        let measurement_id = identifier(&fields.measurement_id, "measurementId")?;
        let device_type = bounded(&fields.device_type, "deviceType")?;
        let os_version = bounded(&fields.os_version, "osVersion")?;
        let app_version = bounded(&fields.app_version, "appVersion")?;
        let modality = bounded(&fields.modality, "modality")?;

        let length = parse_f64(&fields.length, "length")?;
        if !(length >= 0.0) {
            return Err(invalid("length", "must be a non-negative number of meters"));
        }

        let location_count = parse_u64(&fields.location_count, "locationCount")?;
        let format_version = parse_u32(&fields.format_version, "formatVersion")?;

        let attachment_id = match &fields.attachment_id {
            Some(_) => Some(identifier(&fields.attachment_id, "attachmentId")?),
            None => None,
        };

        let location_fields = [
            &fields.start_loc_lat,
            &fields.start_loc_lon,
            &fields.start_loc_ts,
            &fields.end_loc_lat,
            &fields.end_loc_lon,
            &fields.end_loc_ts,
        ];
        let present = location_fields.iter().filter(|field| field.is_some()).count();
        if present != 0 && present != location_fields.len() {
            return Err(invalid(
                "location",
                "start and end location fields must be present together",
            ));
        }

        let (start_location, end_location) = if present == location_fields.len() {
            let start = location(
                &fields.start_loc_ts,
                &fields.start_loc_lat,
                &fields.start_loc_lon,
                "startLoc",
            )?;
            let end = location(
                &fields.end_loc_ts,
                &fields.end_loc_lat,
                &fields.end_loc_lon,
                "endLoc",
            )?;
            (Some(start), Some(end))
        } else {
            (None, None)
        };

        if location_count < MINIMUM_LOCATION_COUNT {
            return Err(AppError::SkipUpload {
                reason: "too few locations".to_string(),
            });
        }
        if format_version != SUPPORTED_FORMAT_VERSION {
            return Err(AppError::SkipUpload {
                reason: format!("unsupported transfer format version {}", format_version),
            });
        }

        // Past the policy gate location_count >= 2, so both ends are required.
        if start_location.is_none() || end_location.is_none() {
            return Err(invalid(
                "location",
                "measurements with locations must carry start and end locations",
            ));
        }

        Ok(MeasurementMetadata {
            device_id,
            measurement_id,
            device_type,
            os_version,
            app_version,
            modality,
            length,
            location_count,
            start_location,
            end_location,
            format_version,
            attachment_id,
        })
    }

    /// Parses a chunk upload's `Content-Range: bytes <from>-<to>/<total>`.
    pub fn parse_content_range(header: &str) -> AppResult<ContentRange> {
        let unparsable = || AppError::Unparsable {
            message: format!("malformed Content-Range header: {}", header),
        };

        let rest = header.strip_prefix("bytes ").ok_or_else(unparsable)?;
        let (range, total) = rest.split_once('/').ok_or_else(unparsable)?;
        let (from, to) = range.split_once('-').ok_or_else(unparsable)?;

        Ok(ContentRange {
            from: parse_decimal(from).ok_or_else(unparsable)?,
            to: parse_decimal(to).ok_or_else(unparsable)?,
            total: parse_decimal(total).ok_or_else(unparsable)?,
        })
    }

    /// Parses a status probe's `Content-Range: bytes */<total>`.
    pub fn parse_status_range(header: &str) -> AppResult<u64> {
        let unparsable = || AppError::Unparsable {
            message: format!("malformed status Content-Range header: {}", header),
        };

        let total = header.strip_prefix("bytes */").ok_or_else(unparsable)?;
        parse_decimal(total).ok_or_else(unparsable)
    }

    /// Validates the declared total size of a pre-request.
    pub fn check_declared_size(header: Option<&str>, limit: u64) -> AppResult<u64> {
        let value = header.ok_or_else(|| AppError::Unparsable {
            message: format!("missing {} header", HEADER_UPLOAD_CONTENT_LENGTH),
        })?;

        let size = parse_decimal(value.trim()).ok_or_else(|| AppError::Unparsable {
            message: format!("{} is not a non-negative integer", HEADER_UPLOAD_CONTENT_LENGTH),
        })?;

        if size == 0 {
            return Err(AppError::Unparsable {
                message: "declared upload size must be at least one byte".to_string(),
            });
        }
        if size > limit {
            return Err(AppError::PayloadTooLarge { size, limit });
        }

        Ok(size)
    }
}

/// Strict decimal parser: digits only, no signs, no whitespace.
fn parse_decimal(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn invalid(field: &str, reason: &str) -> AppError {
    AppError::InvalidMetadata {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn required(value: &Option<String>, field: &str) -> AppResult<String> {
    match value {
        Some(text) if !text.is_empty() => Ok(text.clone()),
        _ => Err(invalid(field, "is required")),
    }
}

fn bounded(value: &Option<String>, field: &str) -> AppResult<String> {
    let text = required(value, field)?;
    if text.len() > MAX_METADATA_FIELD_LENGTH {
        return Err(invalid(field, "exceeds the maximum field length"));
    }
    Ok(text)
}

fn identifier(value: &Option<String>, field: &str) -> AppResult<String> {
    let text = required(value, field)?;
    if text.len() > MAX_IDENTIFIER_LENGTH || parse_decimal(&text).is_none() {
        return Err(invalid(field, "must be a non-negative integer"));
    }
    Ok(text)
}

fn parse_u64(value: &Option<String>, field: &str) -> AppResult<u64> {
    let text = required(value, field)?;
    parse_decimal(&text).ok_or_else(|| invalid(field, "must be a non-negative integer"))
}

fn parse_u32(value: &Option<String>, field: &str) -> AppResult<u32> {
    let number = parse_u64(value, field)?;
    u32::try_from(number).map_err(|_| invalid(field, "is out of range"))
}

fn parse_f64(value: &Option<String>, field: &str) -> AppResult<f64> {
    let text = required(value, field)?;
    text.parse()
        .map_err(|_| invalid(field, "must be a number"))
}

fn parse_i64(value: &Option<String>, field: &str) -> AppResult<i64> {
    let text = required(value, field)?;
    text.parse()
        .map_err(|_| invalid(field, "must be an integer"))
}

fn location(
    ts: &Option<String>,
    lat: &Option<String>,
    lon: &Option<String>,
    prefix: &str,
) -> AppResult<GeoLocation> {
    let timestamp = parse_i64(ts, &format!("{}TS", prefix))?;
    let lat_value = parse_f64(lat, &format!("{}Lat", prefix))?;
    let lon_value = parse_f64(lon, &format!("{}Lon", prefix))?;

    if !(-90.0..=90.0).contains(&lat_value) {
        return Err(invalid(&format!("{}Lat", prefix), "is out of range"));
    }
    if !(-180.0..=180.0).contains(&lon_value) {
        return Err(invalid(&format!("{}Lon", prefix), "is out of range"));
    }

    Ok(GeoLocation {
        timestamp,
        lat: lat_value,
        lon: lon_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_fields() -> MetadataFields {
        MetadataFields {
            device_id: Some("d329c6ec-2764-44b1-b56a-9e3506508424".into()),
            measurement_id: Some("1".into()),
            device_type: Some("Pixel 8".into()),
            os_version: Some("Android 15".into()),
            app_version: Some("4.2.0".into()),
            modality: Some("BICYCLE".into()),
            length: Some("468.8".into()),
            location_count: Some("172".into()),
            format_version: Some("2".into()),
            start_loc_lat: Some("51.05".into()),
            start_loc_lon: Some("13.72".into()),
            start_loc_ts: Some("1696152281000".into()),
            end_loc_lat: Some("51.07".into()),
            end_loc_lon: Some("13.75".into()),
            end_loc_ts: Some("1696152581000".into()),
            attachment_id: None,
        }
    }

    #[test]
    fn valid_metadata_passes() {
        let metadata = ValidationMiddleware::validate_metadata(&valid_fields()).unwrap();
        assert_eq!(metadata.device_id, "d329c6ec-2764-44b1-b56a-9e3506508424");
        assert_eq!(metadata.location_count, 172);
        assert_eq!(metadata.start_location.unwrap().lat, 51.05);
        assert_eq!(metadata.end_location.unwrap().timestamp, 1_696_152_581_000);
    }

    #[test]
    fn missing_format_version_is_invalid() {
        let mut fields = valid_fields();
        fields.format_version = None;
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::InvalidMetadata { .. }));
    }

    #[test]
    fn unsupported_format_version_is_refused() {
        let mut fields = valid_fields();
        fields.format_version = Some("1".into());
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::SkipUpload { .. }));
    }

    #[test]
    fn too_few_locations_are_refused() {
        let mut fields = valid_fields();
        fields.location_count = Some("1".into());
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::SkipUpload { .. }));
    }

    #[test]
    fn device_id_must_be_a_uuid() {
        let mut fields = valid_fields();
        fields.device_id = Some("not-a-uuid-but-thirty-six-chars-long".into());
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::InvalidMetadata { .. }));
    }

    #[test]
    fn partial_location_pair_is_invalid() {
        let mut fields = valid_fields();
        fields.end_loc_ts = None;
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::InvalidMetadata { .. }));
    }

    #[test]
    fn latitude_out_of_range_is_invalid() {
        let mut fields = valid_fields();
        fields.start_loc_lat = Some("91.0".into());
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::InvalidMetadata { .. }));
    }

    #[test]
    fn measurement_id_must_be_decimal() {
        let mut fields = valid_fields();
        fields.measurement_id = Some("-3".into());
        let error = ValidationMiddleware::validate_metadata(&fields).unwrap_err();
        assert!(matches!(error, AppError::InvalidMetadata { .. }));
    }

    #[test]
    fn content_range_parses_chunk_shape() {
        let range = ValidationMiddleware::parse_content_range("bytes 100-249/250").unwrap();
        assert_eq!(
            range,
            ContentRange {
                from: 100,
                to: 249,
                total: 250
            }
        );
    }

    #[test]
    fn content_range_rejects_malformed_headers() {
        for header in [
            "bytes 100-249",
            "bytes */250",
            "100-249/250",
            "bytes -1-249/250",
            "bytes 1e1-249/250",
            "bytes 100-249/",
            "",
        ] {
            let error = ValidationMiddleware::parse_content_range(header).unwrap_err();
            assert!(matches!(error, AppError::Unparsable { .. }), "{}", header);
        }
    }

    #[test]
    fn status_range_parses_probe_shape() {
        assert_eq!(
            ValidationMiddleware::parse_status_range("bytes */250").unwrap(),
            250
        );
        assert!(ValidationMiddleware::parse_status_range("bytes 0-9/250").is_err());
    }

    #[test]
    fn declared_size_within_limit_passes() {
        assert_eq!(
            ValidationMiddleware::check_declared_size(Some("100"), 1000).unwrap(),
            100
        );
    }

    #[test]
    fn declared_size_over_limit_is_too_large() {
        let error = ValidationMiddleware::check_declared_size(Some("2000"), 1000).unwrap_err();
        assert!(matches!(error, AppError::PayloadTooLarge { .. }));
    }

    #[test]
    fn declared_size_rejects_garbage_and_zero() {
        for value in [Some("abc"), Some("0"), Some("-1"), None] {
            let error = ValidationMiddleware::check_declared_size(value, 1000).unwrap_err();
            assert!(matches!(error, AppError::Unparsable { .. }));
        }
    }

    #[test]
    fn principal_is_extracted_from_bearer_token() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user-81"}"#);
        let header = format!("Bearer header.{}.signature", payload);
        let principal = AuthMiddleware::principal_from_bearer(&header).unwrap();
        assert_eq!(principal.user_id, "user-81");
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        for header in ["Token abc", "Bearer not-a-jwt", "Bearer a.!!!.c"] {
            let error = AuthMiddleware::principal_from_bearer(header).unwrap_err();
            assert!(matches!(error, AppError::AuthError { .. }), "{}", header);
        }
    }
}
