//! # Scheduled Cleanup
//!
//! Reclaims abandoned partial uploads. Staging blobs whose last-modified
//! time exceeds the configured expiration window are deleted; a session
//! still referring to such a blob self-heals on its next probe or chunk.
//! Committed measurement objects live outside the staging prefix and the
//! metadata store is never touched, so completed uploads are safe from
//! this task by construction. Session records that went untouched for the
//! same window are pruned alongside.

use chrono::{Duration, Utc};
use serde_json::json;
use worker::{Date, Env};

use crate::config::Config;
use crate::database::{ensure_schema_once, SessionService};
use crate::errors::AppResult;
use crate::logging::Logger;
use crate::storage::R2BlobStore;

/// Summary of one blob-reclamation sweep.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub scanned: u64,
    pub deleted: u64,
}

/// True iff a blob uploaded at `uploaded_ms` has outlived the expiration
/// window at `now_ms`.
pub fn is_expired(uploaded_ms: u64, now_ms: u64, expiration_ms: u64) -> bool {
    now_ms.saturating_sub(uploaded_ms) > expiration_ms
}

/// Deletes staging blobs older than the expiration window.
pub async fn reap_expired_blobs(
    store: &R2BlobStore,
    expiration_ms: u64,
    logger: &Logger,
) -> AppResult<ReapReport> {
    let now_ms = Date::now().as_millis();
    let mut report = ReapReport::default();
    let mut cursor = None;

    loop {
        let (blobs, next_cursor) = store.list_staging(cursor).await?;
        for blob in blobs {
            report.scanned += 1;
            if is_expired(blob.uploaded_ms, now_ms, expiration_ms) {
                store.delete_key(&blob.key).await?;
                report.deleted += 1;
                logger.info(
                    "Reclaimed expired staging blob",
                    Some(json!({
                        "key": blob.key,
                        "ageMs": now_ms.saturating_sub(blob.uploaded_ms),
                    })),
                );
            }
        }

        match next_cursor {
            Some(next_cursor) => cursor = Some(next_cursor),
            None => break,
        }
    }

    Ok(report)
}

/// One full cleanup run: expired staging blobs, then stale sessions.
pub async fn run(env: &Env, config: &Config) -> AppResult<()> {
    let logger = Logger::for_request();
    ensure_schema_once(env, &config.database_name).await?;

    let store = R2BlobStore::new(env)?;
    let report = reap_expired_blobs(&store, config.upload_expiration_ms, &logger).await?;

    let sessions = SessionService::new(env, &config.database_name)?;
    let cutoff = Utc::now() - Duration::milliseconds(config.upload_expiration_ms as i64);
    sessions.remove_stale(&cutoff).await?;

    logger.info(
        "Cleanup finished",
        Some(json!({
            "scannedBlobs": report.scanned,
            "deletedBlobs": report.deleted,
            "sessionCutoff": cutoff.to_rfc3339(),
        })),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEEK_MS: u64 = 604_800_000;

    #[test]
    fn blobs_younger_than_the_window_survive() {
        assert!(!is_expired(1_000, 1_000 + WEEK_MS, WEEK_MS));
        assert!(!is_expired(1_000, 500, WEEK_MS));
    }

    #[test]
    fn blobs_older_than_the_window_expire() {
        assert!(is_expired(1_000, 1_001 + WEEK_MS, WEEK_MS));
    }
}
