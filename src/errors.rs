//! # Error Handling and Response Management
//!
//! Structured error handling for the measurement collector. Every failure
//! the protocol can produce is a variant of [`AppError`]; handlers model
//! their control flow with these variants and the HTTP status appears only
//! at the response boundary, in [`AppError::to_response`].
//!
//! ## Status mapping
//!
//! - **422**: malformed syntax, invalid metadata, payload over limit,
//!   session/request mismatch
//! - **412**: the server refuses this upload as a matter of policy
//! - **409**: the measurement is already stored
//! - **404**: unknown or expired session, upload that must be restarted
//! - **401**: missing or malformed credentials
//! - **500**: storage, database and internal failures

use http::StatusCode;
use serde_json::json;
use thiserror::Error;
use worker::{Error as WorkerError, Response, Result};

/// Application error enumeration covering all failure kinds of the
/// resumable upload protocol and its storage pipeline.
#[derive(Error, Debug)]
pub enum AppError {
    /// Request syntax could not be parsed (headers, ranges, JSON).
    #[error("Unparsable request: {message}")]
    Unparsable {
        /// What could not be parsed
        message: String,
    },

    /// Metadata is syntactically valid JSON/headers but semantically bad.
    #[error("Invalid metadata field {field}: {reason}")]
    InvalidMetadata {
        /// Offending metadata field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Server-side policy refuses this upload; the client must not retry.
    #[error("Upload refused: {reason}")]
    SkipUpload {
        /// Policy reason, e.g. too few locations
        reason: String,
    },

    /// Declared or observed size exceeds the configured limit.
    #[error("Payload of {size} bytes exceeds the limit of {limit}")]
    PayloadTooLarge {
        /// Size the client declared or sent
        size: u64,
        /// Configured payload limit in bytes
        limit: u64,
    },

    /// Session state is inconsistent with the request, a client bug.
    #[error("Illegal session: {message}")]
    IllegalSession {
        /// Description of the inconsistency
        message: String,
    },

    /// Session unknown or expired; the client must issue a new pre-request.
    #[error("Session expired: {message}")]
    SessionExpired {
        /// Why the upload cannot continue
        message: String,
    },

    /// The measurement has already been stored completely.
    #[error("Measurement {measurement_id} of device {device_id} is already stored")]
    MeasurementExists {
        /// Device identifier of the conflicting measurement
        device_id: String,
        /// Measurement identifier of the conflicting measurement
        measurement_id: String,
    },

    /// Post-write verification failed; bytes were lost at the object store.
    #[error("Stored blob holds {actual} bytes but the content range promised {expected}")]
    ContentRangeMismatch {
        /// Bytes the accepted range implies
        expected: u64,
        /// Bytes actually present in the blob
        actual: u64,
    },

    /// More than one document matched a key that must be unique.
    #[error("{count} documents stored for device {device_id}, measurement {measurement_id}")]
    DuplicatesInDatabase {
        /// Device identifier of the duplicated measurement
        device_id: String,
        /// Measurement identifier of the duplicated measurement
        measurement_id: String,
        /// Number of matching documents
        count: u64,
    },

    /// Object storage operation failure.
    #[error("Object storage error: {message}")]
    StorageError {
        /// Detailed error message from the blob backend
        message: String,
    },

    /// Database operation failure.
    #[error("Database error: {message}")]
    DatabaseError {
        /// Detailed error message from the database operation
        message: String,
    },

    /// Configuration loading or validation error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Detailed configuration error message
        message: String,
    },

    /// Missing or malformed credentials.
    #[error("Authentication error: {message}")]
    AuthError {
        /// Detailed authentication error message
        message: String,
    },

    /// Unexpected internal server error.
    #[error("Internal server error: {message}")]
    InternalError {
        /// Detailed internal error message
        message: String,
    },
}

impl AppError {
    /// The HTTP status this error maps to at the response boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unparsable { .. }
            | AppError::InvalidMetadata { .. }
            | AppError::PayloadTooLarge { .. }
            | AppError::IllegalSession { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::SkipUpload { .. } => StatusCode::PRECONDITION_FAILED,
            AppError::SessionExpired { .. } => StatusCode::NOT_FOUND,
            AppError::MeasurementExists { .. } => StatusCode::CONFLICT,
            AppError::AuthError { .. } => StatusCode::UNAUTHORIZED,
            AppError::ContentRangeMismatch { .. }
            | AppError::DuplicatesInDatabase { .. }
            | AppError::StorageError { .. }
            | AppError::DatabaseError { .. }
            | AppError::ConfigError { .. }
            | AppError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code used in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unparsable { .. } => "UNPARSABLE",
            AppError::InvalidMetadata { .. } => "INVALID_METADATA",
            AppError::SkipUpload { .. } => "SKIP_UPLOAD",
            AppError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            AppError::IllegalSession { .. } => "ILLEGAL_SESSION",
            AppError::SessionExpired { .. } => "SESSION_EXPIRED",
            AppError::MeasurementExists { .. } => "MEASUREMENT_EXISTS",
            AppError::ContentRangeMismatch { .. } => "CONTENT_RANGE_MISMATCH",
            AppError::DuplicatesInDatabase { .. } => "DUPLICATES_IN_DATABASE",
            AppError::StorageError { .. } => "STORAGE_ERROR",
            AppError::DatabaseError { .. } => "DATABASE_ERROR",
            AppError::ConfigError { .. } => "CONFIG_ERROR",
            AppError::AuthError { .. } => "AUTH_ERROR",
            AppError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Converts the error into the HTTP response sent to the client.
    ///
    /// The body carries a machine-readable code, a human-readable message
    /// and a UTC timestamp:
    ///
    /// ```json
    /// {
    ///   "error": {
    ///     "code": "SKIP_UPLOAD",
    ///     "message": "Upload refused: too few locations",
    ///     "timestamp": "2024-01-15T10:30:00Z"
    ///   }
    /// }
    /// ```
    pub fn to_response(&self) -> Result<Response> {
        let error_response = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        });

        Ok(Response::from_json(&error_response)?.with_status(self.status().as_u16()))
    }
}

/// Conversion from Cloudflare Worker runtime errors, classified by the
/// failing binding where the message allows it.
impl From<WorkerError> for AppError {
    fn from(err: WorkerError) -> Self {
        let message = err.to_string();

        if message.contains("D1") || message.contains("database") {
            AppError::DatabaseError { message }
        } else if message.contains("KV") || message.contains("kv") {
            AppError::ConfigError { message }
        } else if message.contains("R2") || message.contains("bucket") {
            AppError::StorageError { message }
        } else {
            AppError::InternalError { message }
        }
    }
}

/// Type alias for Results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_unprocessable_entity() {
        let errors = [
            AppError::Unparsable {
                message: "bad header".into(),
            },
            AppError::InvalidMetadata {
                field: "deviceId".into(),
                reason: "not a UUID".into(),
            },
            AppError::PayloadTooLarge {
                size: 200,
                limit: 100,
            },
            AppError::IllegalSession {
                message: "identifiers do not match".into(),
            },
        ];

        for error in errors {
            assert_eq!(error.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[test]
    fn refusal_maps_to_precondition_failed() {
        let error = AppError::SkipUpload {
            reason: "too few locations".into(),
        };
        assert_eq!(error.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(error.code(), "SKIP_UPLOAD");
    }

    #[test]
    fn expired_session_maps_to_not_found() {
        let error = AppError::SessionExpired {
            message: "unknown session".into(),
        };
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_and_server_errors() {
        let conflict = AppError::MeasurementExists {
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
        };
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let mismatch = AppError::ContentRangeMismatch {
            expected: 100,
            actual: 80,
        };
        assert_eq!(mismatch.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let duplicates = AppError::DuplicatesInDatabase {
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
            count: 2,
        };
        assert_eq!(duplicates.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
