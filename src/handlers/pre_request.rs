//! # Pre-Request Handler
//!
//! Phase 1 of the resumable upload protocol: a client announces the
//! metadata and total size of a measurement it wants to upload. The
//! server validates the announcement, checks for an existing copy, opens
//! an upload session bound to the measurement identity and replies with a
//! `Location` URL that embeds the session id.

use serde_json::json;
use worker::*;

use crate::config::Config;
use crate::constants::{
    HEADER_FORWARDED_PROTO, HEADER_UPLOAD_CONTENT_LENGTH, HEADER_UPLOAD_SESSION,
};
use crate::database::{MeasurementService, SessionService};
use crate::errors::{AppError, AppResult};
use crate::logging::Logger;
use crate::middleware::{AuthMiddleware, ValidationMiddleware};
use crate::models::MetadataFields;
use crate::utils::location_url;

/// Handles `POST <prefix>/measurements`.
///
/// Replies `200` with the session `Location` and an empty body, `409`
/// when the measurement is already stored, `412` when the server refuses
/// the upload, and `422` on malformed or incomplete announcements.
pub async fn handle_pre_request(
    mut req: Request,
    env: &Env,
    config: &Config,
    logger: &Logger,
) -> AppResult<Response> {
    let principal = AuthMiddleware::authenticate(&req)?;

    let declared_size = ValidationMiddleware::check_declared_size(
        header(&req, HEADER_UPLOAD_CONTENT_LENGTH).as_deref(),
        config.measurement_payload_limit,
    )?;

    let body: serde_json::Value = req.json().await.map_err(|_| AppError::Unparsable {
        message: "request body is not valid JSON".to_string(),
    })?;
    let metadata = ValidationMiddleware::validate_metadata(&MetadataFields::from_json(&body))?;

    let sessions = SessionService::new(env, &config.database_name)?;

    // A pre-request announcing a session that is already bound to a
    // measurement is a client bug.
    if let Some(session_id) = header(&req, HEADER_UPLOAD_SESSION) {
        if sessions.get(&session_id).await?.is_some() {
            return Err(AppError::IllegalSession {
                message: format!("session {session_id} is already bound to a measurement"),
            });
        }
    }

    let measurements = MeasurementService::new(env, &config.database_name)?;
    if measurements
        .exists(
            &metadata.device_id,
            &metadata.measurement_id,
            metadata.attachment_id.as_deref(),
        )
        .await?
    {
        return Err(AppError::MeasurementExists {
            device_id: metadata.device_id,
            measurement_id: metadata.measurement_id,
        });
    }

    let session = sessions.create(&metadata).await?;

    let url = req.url().map_err(|err| AppError::InternalError {
        message: format!("failed to parse request URL: {err}"),
    })?;
    let location = location_url(
        &url,
        header(&req, HEADER_FORWARDED_PROTO).as_deref(),
        &session.session_id,
    );

    logger.info(
        "Upload session opened",
        Some(json!({
            "sessionId": session.session_id,
            "deviceId": session.device_id,
            "measurementId": session.measurement_id,
            "attachmentId": session.attachment_id,
            "userId": principal.user_id,
            "declaredBytes": declared_size,
        })),
    );

    let headers = Headers::new();
    headers.set("Location", &location)?;
    headers.set("Content-Length", "0")?;

    Ok(Response::empty()?.with_headers(headers))
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).ok().flatten()
}
