//! # Application Constants
//!
//! Application-wide constants for the measurement collector. Binding names
//! must match the worker configuration; protocol constants follow the
//! resumable-upload wire contract the mobile clients speak.

/// KV configuration binding name
pub const CONFIG_KV_BINDING: &str = "COLLECTOR_CONFIG";

/// R2 bucket binding holding measurement payloads
pub const MEASUREMENT_BUCKET_BINDING: &str = "MEASUREMENT_BUCKET";

/// Default D1 database binding for metadata and upload sessions
pub const COLLECTOR_DB_BINDING: &str = "COLLECTOR_DB";

/// Default API prefix all measurement routes nest under
pub const DEFAULT_API_ENDPOINT: &str = "/api/v3";

/// Default upper bound for a measurement payload (100 MiB), applied to the
/// declared total size and to every single chunk body
pub const DEFAULT_PAYLOAD_LIMIT: u64 = 104_857_600;

/// Default age (7 days, in milliseconds) after which abandoned partial
/// uploads are reclaimed
pub const DEFAULT_UPLOAD_EXPIRATION_MS: u64 = 604_800_000;

/// The single transfer format version this collector accepts
pub const SUPPORTED_FORMAT_VERSION: u32 = 2;

/// Device identifiers are UUIDs, 36 bytes in their canonical text form
pub const DEVICE_ID_LENGTH: usize = 36;

/// Measurement and attachment identifiers are decimal strings
pub const MAX_IDENTIFIER_LENGTH: usize = 20;

/// Cap for free-form metadata fields (device type, OS version, ...)
pub const MAX_METADATA_FIELD_LENGTH: usize = 30;

/// Uploads describing fewer locations than this are refused outright
pub const MINIMUM_LOCATION_COUNT: u64 = 2;

/// Key prefix for in-progress blobs; only this area is reaped
pub const STAGING_PREFIX: &str = "staging";

/// HTTP header carrying the declared total size on the pre-request
pub const HEADER_UPLOAD_CONTENT_LENGTH: &str = "x-upload-content-length";

/// HTTP header carrying the chunk range or the status-probe marker
pub const HEADER_CONTENT_RANGE: &str = "Content-Range";

/// HTTP header with the size of the request body
pub const HEADER_CONTENT_LENGTH: &str = "content-length";

/// HTTP header a reverse proxy uses to preserve the original scheme
pub const HEADER_FORWARDED_PROTO: &str = "X-Forwarded-Proto";

/// Optional HTTP header echoing a previously opened upload session
pub const HEADER_UPLOAD_SESSION: &str = "X-Upload-Session";

/// CORS header for allowed origins
pub const CORS_ALLOW_ORIGIN: &str = "*";

/// CORS header for allowed methods
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, OPTIONS";

/// CORS header for allowed headers
pub const CORS_ALLOW_HEADERS: &str = "Authorization, Content-Type, Content-Range, \
    x-upload-content-length, X-Upload-Session, deviceId, measurementId, attachmentId";
