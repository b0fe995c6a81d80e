//! # Data Models and Types
//!
//! Core data structures of the measurement collector: the validated
//! measurement metadata clients announce, the server-side upload session
//! bound to it, and the document persisted once an upload completes.
//!
//! Metadata reaches the server once, as JSON body fields on the
//! pre-request. [`MetadataFields`] captures the raw wire values;
//! validation into [`MeasurementMetadata`] lives in the middleware, and
//! the validated value travels with the upload session from then on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A geographic coordinate captured at the start or end of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Capture time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Latitude in decimal degrees, within [-90, 90].
    pub lat: f64,
    /// Longitude in decimal degrees, within [-180, 180].
    pub lon: f64,
}

/// Validated metadata describing one measurement upload.
///
/// Instances only exist after validation; the fields therefore satisfy the
/// length, range and presence rules of the transfer format. Constructed
/// once from the pre-request body and immutable thereafter; the upload
/// session carries it until the final chunk persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementMetadata {
    /// World-wide unique identifier of the capturing device, a UUID.
    pub device_id: String,
    /// Device-local measurement counter as a decimal string.
    pub measurement_id: String,
    /// Device model, e.g. "Pixel 8".
    pub device_type: String,
    /// Operating system version of the capturing device.
    pub os_version: String,
    /// Version of the capture application.
    pub app_version: String,
    /// Transportation modality the measurement was captured in.
    pub modality: String,
    /// Length of the captured track in meters.
    pub length: f64,
    /// Number of geographic locations in the payload.
    pub location_count: u64,
    /// First captured location; present iff `location_count > 0`.
    pub start_location: Option<GeoLocation>,
    /// Last captured location; present iff `location_count > 0`.
    pub end_location: Option<GeoLocation>,
    /// Version of the binary transfer format in the payload.
    pub format_version: u32,
    /// Set when this upload is an attachment to a measurement.
    pub attachment_id: Option<String>,
}

/// Raw metadata values as they appeared in the pre-request body, prior
/// to validation.
///
/// Every field is optional and kept as text; the validator decides about
/// presence, syntax and ranges so it can be exercised without any I/O.
#[derive(Debug, Clone, Default)]
pub struct MetadataFields {
    pub device_id: Option<String>,
    pub measurement_id: Option<String>,
    pub device_type: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub modality: Option<String>,
    pub length: Option<String>,
    pub location_count: Option<String>,
    pub format_version: Option<String>,
    pub start_loc_lat: Option<String>,
    pub start_loc_lon: Option<String>,
    pub start_loc_ts: Option<String>,
    pub end_loc_lat: Option<String>,
    pub end_loc_lon: Option<String>,
    pub end_loc_ts: Option<String>,
    pub attachment_id: Option<String>,
}

impl MetadataFields {
    /// Extracts metadata fields from a pre-request JSON body.
    ///
    /// Clients send numbers for numeric fields and strings for the rest;
    /// both are accepted and normalized to text here.
    pub fn from_json(body: &Value) -> Self {
        Self {
            device_id: json_field(body, "deviceId"),
            measurement_id: json_field(body, "measurementId"),
            device_type: json_field(body, "deviceType"),
            os_version: json_field(body, "osVersion"),
            app_version: json_field(body, "appVersion"),
            modality: json_field(body, "modality"),
            length: json_field(body, "length"),
            location_count: json_field(body, "locationCount"),
            format_version: json_field(body, "formatVersion"),
            start_loc_lat: json_field(body, "startLocLat"),
            start_loc_lon: json_field(body, "startLocLon"),
            start_loc_ts: json_field(body, "startLocTS"),
            end_loc_lat: json_field(body, "endLocLat"),
            end_loc_lon: json_field(body, "endLocLon"),
            end_loc_ts: json_field(body, "endLocTS"),
            attachment_id: json_field(body, "attachmentId"),
        }
    }

}

fn json_field(body: &Value, name: &str) -> Option<String> {
    match body.get(name) {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}

/// Server-side state of one resumable upload.
///
/// Created bound to its `(device, measurement)` pair by the pre-request;
/// `upload_identifier` is allocated with the first accepted chunk and
/// `bytes_received` mirrors the committed blob size from then on. The
/// validated metadata announced by the pre-request travels along so the
/// final chunk can persist it without the client repeating it.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Opaque identifier embedded in the `Location` URL.
    pub session_id: String,
    /// Device this session is bound to.
    pub device_id: String,
    /// Measurement this session is bound to.
    pub measurement_id: String,
    /// Attachment identifier when this session uploads an attachment.
    pub attachment_id: Option<String>,
    /// Name of the blob pair in the object store, absent until the first
    /// chunk is accepted.
    pub upload_identifier: Option<String>,
    /// Bytes committed to the object store so far.
    pub bytes_received: u64,
    /// When the pre-request opened this session.
    pub created_at: DateTime<Utc>,
    /// Last time a request made progress on this session.
    pub last_touched: DateTime<Utc>,
    /// The metadata announced by the pre-request, persisted on commit.
    pub metadata: MeasurementMetadata,
}

/// The document persisted for a completed upload.
///
/// Written exactly once, after the blob is fully committed; never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementDocument {
    /// Upload identifier, doubling as the object-store file name.
    pub filename: String,
    /// Total size of the stored payload in bytes.
    pub byte_size: u64,
    /// When the final chunk was accepted.
    pub upload_date: DateTime<Utc>,
    /// Stable identifier of the uploading user.
    pub user_id: String,
    /// The metadata announced by the client, verbatim.
    pub metadata: MeasurementMetadata,
}

impl MeasurementDocument {
    /// Assembles the document for a freshly completed upload.
    pub fn new(
        metadata: MeasurementMetadata,
        user_id: String,
        filename: String,
        byte_size: u64,
    ) -> Self {
        Self {
            filename,
            byte_size,
            upload_date: Utc::now(),
            user_id,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_fields_accept_strings_and_numbers() {
        let body = json!({
            "deviceId": "d329c6ec-2764-44b1-b56a-9e3506508424",
            "measurementId": "1",
            "locationCount": 172,
            "length": 468.8,
            "formatVersion": 2
        });

        let fields = MetadataFields::from_json(&body);
        assert_eq!(
            fields.device_id.as_deref(),
            Some("d329c6ec-2764-44b1-b56a-9e3506508424")
        );
        assert_eq!(fields.measurement_id.as_deref(), Some("1"));
        assert_eq!(fields.location_count.as_deref(), Some("172"));
        assert_eq!(fields.length.as_deref(), Some("468.8"));
        assert_eq!(fields.format_version.as_deref(), Some("2"));
        assert_eq!(fields.attachment_id, None);
    }

    #[test]
    fn json_fields_ignore_non_scalar_values() {
        let body = json!({ "deviceId": ["not", "a", "string"], "modality": null });

        let fields = MetadataFields::from_json(&body);
        assert_eq!(fields.device_id, None);
        assert_eq!(fields.modality, None);
    }
}
