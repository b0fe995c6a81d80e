//! # D1 Database Services
//!
//! Persistence for the measurement collector, backed by Cloudflare D1.
//! Two services share one database: [`SessionService`] owns the mutable
//! upload-session records, [`MeasurementService`] owns the immutable
//! metadata documents written when an upload completes.
//!
//! Uniqueness of `(device_id, measurement_id)` for measurements and of
//! `(device_id, measurement_id, attachment_id)` for attachments is
//! enforced by partial unique indices; the final metadata insert is the
//! single linearization point for "upload succeeded".

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;
use worker::{d1::D1Database, wasm_bindgen::JsValue, Env};

use crate::errors::{AppError, AppResult};
use crate::models::{MeasurementDocument, MeasurementMetadata, UploadSession};
use crate::utils::generate_session_id;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS measurements (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        measurement_id TEXT NOT NULL,
        attachment_id TEXT,
        device_type TEXT NOT NULL,
        os_version TEXT NOT NULL,
        app_version TEXT NOT NULL,
        modality TEXT NOT NULL,
        length REAL NOT NULL,
        location_count INTEGER NOT NULL,
        start_loc_lat REAL,
        start_loc_lon REAL,
        start_loc_ts INTEGER,
        end_loc_lat REAL,
        end_loc_lon REAL,
        end_loc_ts INTEGER,
        format_version INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        byte_size INTEGER NOT NULL,
        upload_date TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS upload_sessions (
        session_id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        measurement_id TEXT NOT NULL,
        attachment_id TEXT,
        upload_identifier TEXT,
        bytes_received INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_touched TEXT NOT NULL,
        metadata TEXT NOT NULL
    )",
];

const INDEX_STATEMENTS: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_measurement_identity
        ON measurements (device_id, measurement_id)
        WHERE attachment_id IS NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_attachment_identity
        ON measurements (device_id, measurement_id, attachment_id)
        WHERE attachment_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_sessions_last_touched
        ON upload_sessions (last_touched)",
];

static SCHEMA_READY: AtomicBool = AtomicBool::new(false);

/// Creates tables and indices once per isolate. Every statement is
/// idempotent, so a race between concurrent requests is harmless.
pub async fn ensure_schema_once(env: &Env, binding: &str) -> AppResult<()> {
    if SCHEMA_READY.load(Ordering::Relaxed) {
        return Ok(());
    }

    let db = database(env, binding)?;
    for statement in SCHEMA_STATEMENTS.iter().chain(INDEX_STATEMENTS.iter()) {
        db.prepare(*statement)
            .run()
            .await
            .map_err(map_d1_error("ensure schema"))?;
    }

    SCHEMA_READY.store(true, Ordering::Relaxed);
    Ok(())
}

fn database(env: &Env, binding: &str) -> AppResult<D1Database> {
    env.d1(binding).map_err(|err| AppError::DatabaseError {
        message: format!("Failed to access D1 binding `{binding}`: {err}"),
    })
}

/// D1-backed store for upload-session state.
///
/// Sessions are keyed by the id embedded in the `Location` URL; all
/// mutations are point updates on that key.
pub struct SessionService {
    db: D1Database,
}

impl SessionService {
    pub fn new(env: &Env, binding: &str) -> AppResult<Self> {
        Ok(Self {
            db: database(env, binding)?,
        })
    }

    /// Opens a fresh session bound to the announced measurement and
    /// returns it, including its newly generated opaque id. The validated
    /// metadata is stored with the session so the final chunk can persist
    /// it without the client repeating it.
    pub async fn create(&self, metadata: &MeasurementMetadata) -> AppResult<UploadSession> {
        let now = Utc::now();
        let session = UploadSession {
            session_id: generate_session_id(),
            device_id: metadata.device_id.clone(),
            measurement_id: metadata.measurement_id.clone(),
            attachment_id: metadata.attachment_id.clone(),
            upload_identifier: None,
            bytes_received: 0,
            created_at: now,
            last_touched: now,
            metadata: metadata.clone(),
        };

        let metadata_json =
            serde_json::to_string(metadata).map_err(|err| AppError::InternalError {
                message: format!("failed to serialize session metadata: {err}"),
            })?;

        let statement = self.db.prepare(
            "INSERT INTO upload_sessions (
                session_id,
                device_id,
                measurement_id,
                attachment_id,
                upload_identifier,
                bytes_received,
                created_at,
                last_touched,
                metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        );

        let statement = statement
            .bind(&[
                JsValue::from_str(&session.session_id),
                JsValue::from_str(&session.device_id),
                JsValue::from_str(&session.measurement_id),
                session
                    .attachment_id
                    .as_deref()
                    .map_or(JsValue::NULL, JsValue::from_str),
                JsValue::NULL,
                JsValue::from_f64(0.0),
                JsValue::from_str(&session.created_at.to_rfc3339()),
                JsValue::from_str(&session.last_touched.to_rfc3339()),
                JsValue::from_str(&metadata_json),
            ])
            .map_err(map_d1_error("bind insert session"))?;

        statement
            .run()
            .await
            .map_err(map_d1_error("insert session"))?;

        Ok(session)
    }

    /// Fetches a session by its opaque id.
    pub async fn get(&self, session_id: &str) -> AppResult<Option<UploadSession>> {
        let statement = self
            .db
            .prepare("SELECT * FROM upload_sessions WHERE session_id = ?1");
        let statement = statement
            .bind(&[JsValue::from_str(session_id)])
            .map_err(map_d1_error("bind load session"))?;
        let row: Option<SessionRow> = statement
            .first(None)
            .await
            .map_err(map_d1_error("load session"))?;

        row.map(SessionRow::try_into_session).transpose()
    }

    /// Writes the mutable part of a session back: the allocated upload
    /// identifier, the byte counter and the touch timestamp.
    pub async fn update(&self, session: &UploadSession) -> AppResult<()> {
        let statement = self.db.prepare(
            "UPDATE upload_sessions
             SET upload_identifier = ?1, bytes_received = ?2, last_touched = ?3
             WHERE session_id = ?4",
        );

        let statement = statement
            .bind(&[
                session
                    .upload_identifier
                    .as_deref()
                    .map_or(JsValue::NULL, JsValue::from_str),
                JsValue::from_f64(session.bytes_received as f64),
                JsValue::from_str(&session.last_touched.to_rfc3339()),
                JsValue::from_str(&session.session_id),
            ])
            .map_err(map_d1_error("bind update session"))?;

        statement
            .run()
            .await
            .map(|_| ())
            .map_err(map_d1_error("update session"))
    }

    /// Removes a session, typically after its upload completed.
    pub async fn remove(&self, session_id: &str) -> AppResult<()> {
        let statement = self
            .db
            .prepare("DELETE FROM upload_sessions WHERE session_id = ?1");
        let statement = statement
            .bind(&[JsValue::from_str(session_id)])
            .map_err(map_d1_error("bind delete session"))?;

        statement
            .run()
            .await
            .map(|_| ())
            .map_err(map_d1_error("delete session"))
    }

    /// Removes sessions untouched since the given cutoff. Timestamps are
    /// stored as RFC 3339 UTC strings, which order lexicographically.
    pub async fn remove_stale(&self, cutoff: &DateTime<Utc>) -> AppResult<()> {
        let statement = self
            .db
            .prepare("DELETE FROM upload_sessions WHERE last_touched < ?1");
        let statement = statement
            .bind(&[JsValue::from_str(&cutoff.to_rfc3339())])
            .map_err(map_d1_error("bind prune sessions"))?;

        statement
            .run()
            .await
            .map(|_| ())
            .map_err(map_d1_error("prune sessions"))
    }
}

/// D1-backed store for completed measurement documents.
pub struct MeasurementService {
    db: D1Database,
}

impl MeasurementService {
    pub fn new(env: &Env, binding: &str) -> AppResult<Self> {
        Ok(Self {
            db: database(env, binding)?,
        })
    }

    /// Persists the document of a completed upload and returns its id.
    ///
    /// The partial unique indices reject a second document for the same
    /// measurement identity; that error surfaces as a database failure and
    /// leaves the first document intact.
    pub async fn store(&self, document: &MeasurementDocument) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let metadata = &document.metadata;

        let statement = self.db.prepare(
            "INSERT INTO measurements (
                id, device_id, measurement_id, attachment_id,
                device_type, os_version, app_version, modality,
                length, location_count,
                start_loc_lat, start_loc_lon, start_loc_ts,
                end_loc_lat, end_loc_lon, end_loc_ts,
                format_version, user_id, filename, byte_size, upload_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                      ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        );

        let statement = statement
            .bind(&[
                JsValue::from_str(&id),
                JsValue::from_str(&metadata.device_id),
                JsValue::from_str(&metadata.measurement_id),
                metadata
                    .attachment_id
                    .as_deref()
                    .map_or(JsValue::NULL, JsValue::from_str),
                JsValue::from_str(&metadata.device_type),
                JsValue::from_str(&metadata.os_version),
                JsValue::from_str(&metadata.app_version),
                JsValue::from_str(&metadata.modality),
                JsValue::from_f64(metadata.length),
                JsValue::from_f64(metadata.location_count as f64),
                metadata
                    .start_location
                    .map_or(JsValue::NULL, |location| JsValue::from_f64(location.lat)),
                metadata
                    .start_location
                    .map_or(JsValue::NULL, |location| JsValue::from_f64(location.lon)),
                metadata.start_location.map_or(JsValue::NULL, |location| {
                    JsValue::from_f64(location.timestamp as f64)
                }),
                metadata
                    .end_location
                    .map_or(JsValue::NULL, |location| JsValue::from_f64(location.lat)),
                metadata
                    .end_location
                    .map_or(JsValue::NULL, |location| JsValue::from_f64(location.lon)),
                metadata.end_location.map_or(JsValue::NULL, |location| {
                    JsValue::from_f64(location.timestamp as f64)
                }),
                JsValue::from_f64(metadata.format_version as f64),
                JsValue::from_str(&document.user_id),
                JsValue::from_str(&document.filename),
                JsValue::from_f64(document.byte_size as f64),
                JsValue::from_str(&document.upload_date.to_rfc3339()),
            ])
            .map_err(map_d1_error("bind insert measurement"))?;

        statement
            .run()
            .await
            .map_err(map_d1_error("insert measurement"))?;

        Ok(id)
    }

    /// True iff exactly one document matches the measurement identity.
    ///
    /// For plain measurements (`attachment_id` = None) only documents
    /// without an attachment id count; for attachments the triple must
    /// match. More than one match means the uniqueness invariant is broken
    /// and requires operator intervention.
    pub async fn exists(
        &self,
        device_id: &str,
        measurement_id: &str,
        attachment_id: Option<&str>,
    ) -> AppResult<bool> {
        let count = self.count(device_id, measurement_id, attachment_id).await?;
        match count {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(AppError::DuplicatesInDatabase {
                device_id: device_id.to_string(),
                measurement_id: measurement_id.to_string(),
                count,
            }),
        }
    }

    async fn count(
        &self,
        device_id: &str,
        measurement_id: &str,
        attachment_id: Option<&str>,
    ) -> AppResult<u64> {
        let (query, bindings) = match attachment_id {
            Some(attachment_id) => (
                "SELECT COUNT(*) AS n FROM measurements
                 WHERE device_id = ?1 AND measurement_id = ?2 AND attachment_id = ?3",
                vec![
                    JsValue::from_str(device_id),
                    JsValue::from_str(measurement_id),
                    JsValue::from_str(attachment_id),
                ],
            ),
            None => (
                "SELECT COUNT(*) AS n FROM measurements
                 WHERE device_id = ?1 AND measurement_id = ?2 AND attachment_id IS NULL",
                vec![
                    JsValue::from_str(device_id),
                    JsValue::from_str(measurement_id),
                ],
            ),
        };

        let statement = self
            .db
            .prepare(query)
            .bind(&bindings)
            .map_err(map_d1_error("bind count measurements"))?;
        let row: Option<CountRow> = statement
            .first(None)
            .await
            .map_err(map_d1_error("count measurements"))?;

        Ok(row.map_or(0, |row| row.n as u64))
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    n: f64,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    session_id: String,
    device_id: String,
    measurement_id: String,
    attachment_id: Option<String>,
    upload_identifier: Option<String>,
    bytes_received: f64,
    created_at: String,
    last_touched: String,
    metadata: String,
}

impl SessionRow {
    fn try_into_session(self) -> AppResult<UploadSession> {
        let created_at = parse_timestamp(&self.created_at, "created_at")?;
        let last_touched = parse_timestamp(&self.last_touched, "last_touched")?;

        let metadata: MeasurementMetadata =
            serde_json::from_str(&self.metadata).map_err(|err| AppError::DatabaseError {
                message: format!("Invalid session metadata: {err}"),
            })?;

        Ok(UploadSession {
            session_id: self.session_id,
            device_id: self.device_id,
            measurement_id: self.measurement_id,
            attachment_id: self.attachment_id,
            upload_identifier: self.upload_identifier,
            bytes_received: self.bytes_received as u64,
            created_at,
            last_touched,
            metadata,
        })
    }
}

fn parse_timestamp(value: &str, column: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| AppError::DatabaseError {
            message: format!("Invalid {column} timestamp: {err}"),
        })
}

fn map_d1_error(operation: &'static str) -> impl Fn(worker::Error) -> AppError {
    move |err| AppError::DatabaseError {
        message: format!("{operation} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoLocation;

    fn sample_metadata_json() -> String {
        let metadata = MeasurementMetadata {
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
            device_type: "Pixel 8".into(),
            os_version: "Android 15".into(),
            app_version: "4.2.0".into(),
            modality: "BICYCLE".into(),
            length: 468.8,
            location_count: 172,
            start_location: Some(GeoLocation {
                timestamp: 1_696_152_281_000,
                lat: 51.05,
                lon: 13.72,
            }),
            end_location: Some(GeoLocation {
                timestamp: 1_696_152_581_000,
                lat: 51.07,
                lon: 13.75,
            }),
            format_version: 2,
            attachment_id: None,
        };

        serde_json::to_string(&metadata).unwrap()
    }

    #[test]
    fn session_row_converts_to_session() {
        let row = SessionRow {
            session_id: "4886f24a".into(),
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
            attachment_id: None,
            upload_identifier: Some("blob-1".into()),
            bytes_received: 100.0,
            created_at: "2024-01-15T10:30:00+00:00".into(),
            last_touched: "2024-01-15T10:31:00+00:00".into(),
            metadata: sample_metadata_json(),
        };

        let session = row.try_into_session().unwrap();
        assert_eq!(session.session_id, "4886f24a");
        assert_eq!(session.bytes_received, 100);
        assert_eq!(session.upload_identifier.as_deref(), Some("blob-1"));
        assert!(session.last_touched > session.created_at);
        assert_eq!(session.metadata.location_count, 172);
        assert_eq!(session.metadata.device_id, session.device_id);
    }

    #[test]
    fn session_row_rejects_broken_timestamps() {
        let row = SessionRow {
            session_id: "4886f24a".into(),
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
            attachment_id: None,
            upload_identifier: None,
            bytes_received: 0.0,
            created_at: "yesterday".into(),
            last_touched: "2024-01-15T10:31:00+00:00".into(),
            metadata: sample_metadata_json(),
        };

        let error = row.try_into_session().unwrap_err();
        assert!(matches!(error, AppError::DatabaseError { .. }));
    }

    #[test]
    fn session_row_rejects_broken_metadata() {
        let row = SessionRow {
            session_id: "4886f24a".into(),
            device_id: "d329c6ec-2764-44b1-b56a-9e3506508424".into(),
            measurement_id: "1".into(),
            attachment_id: None,
            upload_identifier: None,
            bytes_received: 0.0,
            created_at: "2024-01-15T10:30:00+00:00".into(),
            last_touched: "2024-01-15T10:31:00+00:00".into(),
            metadata: "not json".into(),
        };

        let error = row.try_into_session().unwrap_err();
        assert!(matches!(error, AppError::DatabaseError { .. }));
    }
}
