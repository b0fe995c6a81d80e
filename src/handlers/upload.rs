//! # Upload Handler
//!
//! Phase 2 of the resumable upload protocol: the state machine that binds
//! one logical upload to a sequence of `PUT` requests. Each request is
//! either a status probe (`Content-Range: bytes */<total>`, empty body)
//! or a chunk upload (`Content-Range: bytes <from>-<to>/<total>`).
//!
//! The transitions are decided by the pure helpers [`classify_request`]
//! and [`chunk_action`]; HTTP statuses appear only in the response
//! builders. A chunk is accepted iff it starts exactly where the committed
//! blob ends; anything else replies `308` with the authoritative `Range`,
//! which makes duplicate and out-of-order chunks safe.

use chrono::Utc;
use http::StatusCode;
use serde_json::json;
use worker::*;

use crate::config::Config;
use crate::constants::{HEADER_CONTENT_LENGTH, HEADER_CONTENT_RANGE};
use crate::database::{MeasurementService, SessionService};
use crate::errors::{AppError, AppResult};
use crate::logging::Logger;
use crate::middleware::{AuthMiddleware, ContentRange, Principal, ValidationMiddleware};
use crate::models::{MeasurementDocument, UploadSession};
use crate::storage::{BlobStore, R2BlobStore};
use crate::utils::{generate_upload_identifier, session_id_from_path};

/// What a `PUT` on the session URL asks for.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UploadRequest {
    /// Asks how many bytes the server holds; the body is empty.
    Probe { total: u64 },
    /// One contiguous byte range of the payload.
    Chunk(ContentRange),
}

/// Classifies an upload request by body size and `Content-Range` shape.
///
/// A chunk's range must cover exactly the body, and must end within the
/// declared total; everything else is unparsable.
pub(crate) fn classify_request(content_range: &str, body_size: u64) -> AppResult<UploadRequest> {
    if body_size == 0 {
        let total = ValidationMiddleware::parse_status_range(content_range)?;
        return Ok(UploadRequest::Probe { total });
    }

    let range = ValidationMiddleware::parse_content_range(content_range)?;
    let span = range
        .to
        .checked_sub(range.from)
        .and_then(|span| span.checked_add(1));
    if span != Some(body_size) {
        return Err(AppError::Unparsable {
            message: format!(
                "Content-Range {}-{} does not match the body size {}",
                range.from, range.to, body_size
            ),
        });
    }
    if range.to >= range.total {
        return Err(AppError::Unparsable {
            message: "content range ends beyond the declared total".to_string(),
        });
    }

    Ok(UploadRequest::Chunk(range))
}

/// How to treat an arriving chunk, given the session and blob state.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkAction {
    /// No blob yet and the chunk starts at zero: allocate and stream.
    StartNew,
    /// The chunk continues exactly where the blob ends: stream.
    Append,
    /// The chunk does not line up; answer with the authoritative range.
    Resync { committed: u64 },
    /// No blob and a non-zero offset; only a new pre-request can help.
    Reject,
}

/// Decides the chunk precondition. `committed` is the current blob size,
/// `None` when the blob does not exist (never written or reclaimed).
pub(crate) fn chunk_action(
    upload_identifier: Option<&str>,
    committed: Option<u64>,
    from: u64,
) -> ChunkAction {
    match (upload_identifier, committed) {
        // First chunk, or the blob was reclaimed under a stale session.
        (None, _) | (Some(_), None) => {
            if from == 0 {
                ChunkAction::StartNew
            } else {
                ChunkAction::Reject
            }
        }
        (Some(_), Some(committed)) => {
            if from == committed {
                ChunkAction::Append
            } else {
                ChunkAction::Resync { committed }
            }
        }
    }
}

/// Handles `PUT <prefix>/measurements/(<sessionId>)/`.
pub async fn handle_upload(
    req: Request,
    env: &Env,
    config: &Config,
    logger: &Logger,
) -> AppResult<Response> {
    let principal = AuthMiddleware::authenticate(&req)?;

    let url = req.url().map_err(|err| AppError::InternalError {
        message: format!("failed to parse request URL: {err}"),
    })?;
    let session_id = session_id_from_path(url.path()).ok_or_else(|| AppError::SessionExpired {
        message: "upload URL carries no session id".to_string(),
    })?;

    let sessions = SessionService::new(env, &config.database_name)?;
    let session = sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| AppError::SessionExpired {
            message: format!("unknown upload session {session_id}"),
        })?;

    // Upload requests need only Content-Range and the body; a client may
    // still repeat the bound identifiers as headers, and when it does
    // they must match the session binding.
    ensure_session_identity(&req, &session)?;

    let content_range =
        header(&req, HEADER_CONTENT_RANGE).ok_or_else(|| AppError::Unparsable {
            message: "missing Content-Range header".to_string(),
        })?;
    let body_size = body_size(&req)?;

    let store = R2BlobStore::new(env)?;
    let measurements = MeasurementService::new(env, &config.database_name)?;

    match classify_request(&content_range, body_size)? {
        UploadRequest::Probe { .. } => {
            handle_probe(&session, &sessions, &measurements, &store).await
        }
        UploadRequest::Chunk(range) => {
            handle_chunk(
                req,
                range,
                body_size,
                session,
                principal,
                &sessions,
                &measurements,
                &store,
                config,
                logger,
            )
            .await
        }
    }
}

/// Rejects a request whose repeated identity headers contradict the
/// session binding. Absent headers are fine; the session is authoritative.
fn ensure_session_identity(req: &Request, session: &UploadSession) -> AppResult<()> {
    let bindings = [
        ("deviceId", Some(session.device_id.as_str())),
        ("measurementId", Some(session.measurement_id.as_str())),
        ("attachmentId", session.attachment_id.as_deref()),
    ];

    for (name, bound) in bindings {
        let sent = header(req, name);
        if !identity_header_matches(sent.as_deref(), bound) {
            return Err(AppError::IllegalSession {
                message: format!("{name} header does not match the session binding"),
            });
        }
    }

    Ok(())
}

/// True iff a repeated identity header is absent or equals the bound value.
pub(crate) fn identity_header_matches(sent: Option<&str>, bound: Option<&str>) -> bool {
    match sent {
        None => true,
        Some(value) => Some(value) == bound,
    }
}

/// Tells a returning client where to resume.
async fn handle_probe(
    session: &UploadSession,
    sessions: &SessionService,
    measurements: &MeasurementService,
    store: &R2BlobStore,
) -> AppResult<Response> {
    if measurements
        .exists(
            &session.device_id,
            &session.measurement_id,
            session.attachment_id.as_deref(),
        )
        .await?
    {
        // Already stored completely; nothing left to upload.
        return Ok(Response::empty()?.with_status(StatusCode::OK.as_u16()));
    }

    match &session.upload_identifier {
        None => resume_incomplete(None),
        Some(upload_id) => match store.bytes_uploaded(upload_id).await? {
            Some(committed) => resume_incomplete(Some(committed)),
            None => {
                // The blob was reclaimed; reset so the client starts over.
                let mut reset = session.clone();
                reset.upload_identifier = None;
                reset.bytes_received = 0;
                reset.last_touched = Utc::now();
                sessions.update(&reset).await?;
                resume_incomplete(None)
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_chunk(
    req: Request,
    range: ContentRange,
    body_size: u64,
    mut session: UploadSession,
    principal: Principal,
    sessions: &SessionService,
    measurements: &MeasurementService,
    store: &R2BlobStore,
    config: &Config,
    logger: &Logger,
) -> AppResult<Response> {
    let limit = config.measurement_payload_limit;
    if range.total > limit || body_size > limit {
        // This upload can never complete; reclaim its partial state now.
        if let Some(upload_id) = &session.upload_identifier {
            if store.exists(upload_id).await? {
                store.delete(upload_id).await?;
            }
        }
        sessions.remove(&session.session_id).await?;
        return Err(AppError::PayloadTooLarge {
            size: range.total.max(body_size),
            limit,
        });
    }

    let committed = match &session.upload_identifier {
        Some(upload_id) => store.bytes_uploaded(upload_id).await?,
        None => None,
    };

    match chunk_action(session.upload_identifier.as_deref(), committed, range.from) {
        ChunkAction::Reject => Err(AppError::SessionExpired {
            message: format!(
                "no upload in progress at offset {}; a new pre-request is required",
                range.from
            ),
        }),
        ChunkAction::Resync { committed } => resume_incomplete(Some(committed)),
        ChunkAction::StartNew => {
            session.upload_identifier = Some(generate_upload_identifier());
            session.bytes_received = 0;
            session.last_touched = Utc::now();
            sessions.update(&session).await?;
            stream_chunk(
                req,
                range,
                body_size,
                session,
                principal,
                sessions,
                measurements,
                store,
                logger,
            )
            .await
        }
        ChunkAction::Append => {
            stream_chunk(
                req,
                range,
                body_size,
                session,
                principal,
                sessions,
                measurements,
                store,
                logger,
            )
            .await
        }
    }
}

/// Streams the request body into the blob, verifies the resulting size and
/// either acknowledges the intermediate chunk or commits the upload.
#[allow(clippy::too_many_arguments)]
async fn stream_chunk(
    mut req: Request,
    range: ContentRange,
    body_size: u64,
    mut session: UploadSession,
    principal: Principal,
    sessions: &SessionService,
    measurements: &MeasurementService,
    store: &R2BlobStore,
    logger: &Logger,
) -> AppResult<Response> {
    let upload_id = session
        .upload_identifier
        .clone()
        .ok_or_else(|| AppError::InternalError {
            message: "streaming without an upload identifier".to_string(),
        })?;

    let body = req.stream().map_err(|err| AppError::Unparsable {
        message: format!("unreadable request body: {err}"),
    })?;
    let written = store.write(&upload_id, body, body_size).await?;

    let expected = range.to + 1;
    if written != expected {
        logger.error(
            "Blob size does not match the accepted content range",
            Some(json!({
                "sessionId": session.session_id,
                "uploadId": upload_id,
                "expected": expected,
                "actual": written,
            })),
        );
        return Err(AppError::ContentRangeMismatch {
            expected,
            actual: written,
        });
    }

    session.bytes_received = written;
    session.last_touched = Utc::now();
    sessions.update(&session).await?;

    if expected < range.total {
        logger.info(
            "Chunk accepted",
            Some(json!({
                "sessionId": session.session_id,
                "uploadId": upload_id,
                "bytesReceived": written,
                "total": range.total,
            })),
        );
        return resume_incomplete(Some(written));
    }

    // Final chunk: finalize the blob, then let the metadata commit decide.
    store.persist(&upload_id).await?;

    let document = MeasurementDocument::new(
        session.metadata.clone(),
        principal.user_id,
        upload_id.clone(),
        range.total,
    );
    if let Err(err) = measurements.store(&document).await {
        // The staging pair stays for the scheduled cleanup to claim; the
        // durable copy must not outlive a failed commit.
        if let Err(discard_err) = store.discard_persisted(&upload_id).await {
            logger.error(
                "Failed to discard persisted blob after commit failure",
                Some(json!({ "uploadId": upload_id, "error": discard_err.to_string() })),
            );
        }
        return Err(err);
    }

    logger.info(
        "Measurement stored",
        Some(json!({
            "sessionId": session.session_id,
            "uploadId": upload_id,
            "deviceId": session.device_id,
            "measurementId": session.measurement_id,
            "bytes": range.total,
            "userId": document.user_id,
        })),
    );

    // Cleanup failures must not fail a committed upload.
    if let Err(err) = sessions.remove(&session.session_id).await {
        logger.warn(
            "Failed to remove completed session",
            Some(json!({ "sessionId": session.session_id, "error": err.to_string() })),
        );
    }
    if let Err(err) = store.delete(&upload_id).await {
        logger.warn(
            "Failed to clean up staging blobs",
            Some(json!({ "uploadId": upload_id, "error": err.to_string() })),
        );
    }

    Ok(Response::empty()?.with_status(StatusCode::CREATED.as_u16()))
}

/// Builds the `308 Resume Incomplete` reply. The `Range` header names the
/// inclusive interval already stored and is present iff any bytes are.
fn resume_incomplete(committed: Option<u64>) -> AppResult<Response> {
    let headers = Headers::new();
    headers.set("Content-Length", "0")?;
    if let Some(last) = committed.filter(|committed| *committed > 0) {
        headers.set("Range", &format!("bytes=0-{}", last - 1))?;
    }

    Ok(Response::empty()?
        .with_status(StatusCode::PERMANENT_REDIRECT.as_u16())
        .with_headers(headers))
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).ok().flatten()
}

fn body_size(req: &Request) -> AppResult<u64> {
    let value = req
        .headers()
        .get(HEADER_CONTENT_LENGTH)
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Unparsable {
            message: "missing content-length header".to_string(),
        })?;

    value.trim().parse().map_err(|_| AppError::Unparsable {
        message: "content-length is not a non-negative integer".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_with_status_range_is_a_probe() {
        let request = classify_request("bytes */250", 0).unwrap();
        assert_eq!(request, UploadRequest::Probe { total: 250 });
    }

    #[test]
    fn body_with_matching_range_is_a_chunk() {
        let request = classify_request("bytes 100-249/250", 150).unwrap();
        assert_eq!(
            request,
            UploadRequest::Chunk(ContentRange {
                from: 100,
                to: 249,
                total: 250
            })
        );
    }

    #[test]
    fn empty_body_with_chunk_range_is_unparsable() {
        let error = classify_request("bytes 0-99/100", 0).unwrap_err();
        assert!(matches!(error, AppError::Unparsable { .. }));
    }

    #[test]
    fn range_not_covering_the_body_is_unparsable() {
        let error = classify_request("bytes 0-99/250", 50).unwrap_err();
        assert!(matches!(error, AppError::Unparsable { .. }));
    }

    #[test]
    fn inverted_range_is_unparsable() {
        let error = classify_request("bytes 5-4/10", 1).unwrap_err();
        assert!(matches!(error, AppError::Unparsable { .. }));
    }

    #[test]
    fn range_beyond_declared_total_is_unparsable() {
        let error = classify_request("bytes 0-99/50", 100).unwrap_err();
        assert!(matches!(error, AppError::Unparsable { .. }));
    }

    #[test]
    fn repeated_identity_headers_must_match_the_binding() {
        assert!(identity_header_matches(None, Some("d329c6ec")));
        assert!(identity_header_matches(None, None));
        assert!(identity_header_matches(Some("d329c6ec"), Some("d329c6ec")));
        assert!(!identity_header_matches(Some("other"), Some("d329c6ec")));
        // An attachmentId header on a plain measurement session.
        assert!(!identity_header_matches(Some("7"), None));
    }

    #[test]
    fn first_chunk_must_start_at_zero() {
        assert_eq!(chunk_action(None, None, 0), ChunkAction::StartNew);
        assert_eq!(chunk_action(None, None, 100), ChunkAction::Reject);
    }

    #[test]
    fn reclaimed_blob_resets_to_first_chunk() {
        assert_eq!(chunk_action(Some("blob-1"), None, 0), ChunkAction::StartNew);
        assert_eq!(chunk_action(Some("blob-1"), None, 100), ChunkAction::Reject);
    }

    #[test]
    fn continuation_must_match_committed_bytes() {
        assert_eq!(chunk_action(Some("blob-1"), Some(100), 100), ChunkAction::Append);
        assert_eq!(
            chunk_action(Some("blob-1"), Some(100), 200),
            ChunkAction::Resync { committed: 100 }
        );
        // A duplicate of an acknowledged chunk is re-synced, not appended.
        assert_eq!(
            chunk_action(Some("blob-1"), Some(100), 0),
            ChunkAction::Resync { committed: 100 }
        );
    }
}
