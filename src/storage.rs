//! # R2 Blob Storage
//!
//! Object storage for measurement payloads. R2 blobs are immutable, so
//! appending a chunk is emulated: the incoming bytes are spooled into a
//! sibling tmp blob, then tmp and the existing data blob are streamed into
//! a fresh data blob of the combined length. Bytes pass through the worker
//! in stream items; at no point is a whole chunk or payload buffered.
//!
//! In-progress uploads live under the `staging/` key prefix, which is the
//! only area the scheduled cleanup scans. Committing an upload copies the
//! finished blob to its durable key `<uploadId>/data`.

use async_trait::async_trait;
use futures::StreamExt;
use worker::{console_warn, Bucket, ByteStream, Data, Env, FixedLengthStream, Object};

use crate::constants::{MEASUREMENT_BUCKET_BINDING, STAGING_PREFIX};
use crate::errors::{AppError, AppResult};

/// Key of the in-progress data blob for an upload.
pub fn staging_data_key(upload_id: &str) -> String {
    format!("{}/{}/data", STAGING_PREFIX, upload_id)
}

/// Key of the transient append spool for an upload.
pub fn staging_tmp_key(upload_id: &str) -> String {
    format!("{}/{}/tmp", STAGING_PREFIX, upload_id)
}

/// Key of the committed payload of a completed upload.
pub fn durable_data_key(upload_id: &str) -> String {
    format!("{}/data", upload_id)
}

/// Contract of the blob backend the upload state machine writes into.
///
/// Writes for one upload id are serialized by the state machine; writes to
/// distinct upload ids are independent.
#[async_trait(?Send)]
pub trait BlobStore {
    /// Appends a request body to the upload's data blob and returns the
    /// new blob size.
    async fn write(&self, upload_id: &str, body: ByteStream, body_size: u64) -> AppResult<u64>;

    /// Current size of the upload's data blob, `None` if it does not
    /// exist (never written, or reclaimed by the cleanup).
    async fn bytes_uploaded(&self, upload_id: &str) -> AppResult<Option<u64>>;

    /// True iff the upload's data blob exists.
    async fn exists(&self, upload_id: &str) -> AppResult<bool>;

    /// Deletes the upload's data and tmp blobs where present.
    async fn delete(&self, upload_id: &str) -> AppResult<()>;

    /// Copies the finished staging blob to its durable key. The staging
    /// pair stays in place until [`BlobStore::delete`] cleans it up, so a
    /// failed metadata commit leaves the upload reclaimable.
    async fn persist(&self, upload_id: &str) -> AppResult<()>;

    /// Removes the durable copy again, after a failed metadata commit.
    async fn discard_persisted(&self, upload_id: &str) -> AppResult<()>;
}

/// A staging blob as seen by the scheduled cleanup.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub key: String,
    pub uploaded_ms: u64,
}

/// [`BlobStore`] implementation backed by the measurement R2 bucket.
pub struct R2BlobStore {
    bucket: Bucket,
}

impl R2BlobStore {
    pub fn new(env: &Env) -> AppResult<Self> {
        let bucket = env
            .bucket(MEASUREMENT_BUCKET_BINDING)
            .map_err(|err| AppError::StorageError {
                message: format!("Unable to access R2 bucket: {err}"),
            })?;

        Ok(Self { bucket })
    }

    /// One page of staging blobs, for the scheduled cleanup.
    pub async fn list_staging(
        &self,
        cursor: Option<String>,
    ) -> AppResult<(Vec<StagedBlob>, Option<String>)> {
        let mut builder = self.bucket.list().prefix(STAGING_PREFIX);
        if let Some(cursor) = cursor {
            builder = builder.cursor(cursor);
        }

        let listing = builder
            .execute()
            .await
            .map_err(map_r2_error("list staging blobs"))?;

        let blobs = listing
            .objects()
            .iter()
            .map(|object| StagedBlob {
                key: object.key(),
                uploaded_ms: object.uploaded().as_millis(),
            })
            .collect();

        Ok((blobs, listing.cursor()))
    }

    /// Deletes a single blob by key, for the scheduled cleanup.
    pub async fn delete_key(&self, key: &str) -> AppResult<()> {
        self.bucket
            .delete(key)
            .await
            .map_err(map_r2_error("delete blob"))
    }

    async fn object(&self, key: &str) -> AppResult<Option<Object>> {
        self.bucket
            .get(key)
            .execute()
            .await
            .map_err(map_r2_error("read blob"))
    }

    async fn require_object(&self, key: &str) -> AppResult<Object> {
        self.object(key).await?.ok_or_else(|| AppError::StorageError {
            message: format!("blob {key} vanished mid-operation"),
        })
    }
}

#[async_trait(?Send)]
impl BlobStore for R2BlobStore {
    async fn write(&self, upload_id: &str, body: ByteStream, body_size: u64) -> AppResult<u64> {
        let tmp_key = staging_tmp_key(upload_id);
        let data_key = staging_data_key(upload_id);

        // Spool the incoming chunk into the sibling tmp blob. The fixed
        // length lets R2 reject bodies that do not match the announced
        // chunk size.
        let chunk = FixedLengthStream::wrap(body, body_size);
        self.bucket
            .put(&tmp_key, Data::Stream(chunk))
            .execute()
            .await
            .map_err(map_r2_error("write tmp blob"))?;

        // Compose (data, tmp) -> data by streaming both sources into a
        // fresh data blob of the combined length.
        let new_size = match self.object(&data_key).await? {
            None => {
                let tmp = self.require_object(&tmp_key).await?;
                let combined = FixedLengthStream::wrap(body_stream(&tmp)?, body_size);
                self.bucket
                    .put(&data_key, Data::Stream(combined))
                    .execute()
                    .await
                    .map_err(map_r2_error("write data blob"))?;
                body_size
            }
            Some(data) => {
                let prior = data.size();
                let tmp = self.require_object(&tmp_key).await?;
                let combined = body_stream(&data)?.chain(body_stream(&tmp)?);
                let combined = FixedLengthStream::wrap(combined, prior + body_size);
                self.bucket
                    .put(&data_key, Data::Stream(combined))
                    .execute()
                    .await
                    .map_err(map_r2_error("compose data blob"))?;
                prior + body_size
            }
        };

        // Best-effort: a leftover tmp blob is overwritten by the next write.
        if let Err(err) = self.bucket.delete(&tmp_key).await {
            console_warn!("Failed to delete tmp blob {}: {}", tmp_key, err);
        }

        Ok(new_size)
    }

    async fn bytes_uploaded(&self, upload_id: &str) -> AppResult<Option<u64>> {
        Ok(self
            .object(&staging_data_key(upload_id))
            .await?
            .map(|object| object.size()))
    }

    async fn exists(&self, upload_id: &str) -> AppResult<bool> {
        Ok(self.object(&staging_data_key(upload_id)).await?.is_some())
    }

    async fn delete(&self, upload_id: &str) -> AppResult<()> {
        self.bucket
            .delete(staging_tmp_key(upload_id))
            .await
            .map_err(map_r2_error("delete tmp blob"))?;
        self.bucket
            .delete(staging_data_key(upload_id))
            .await
            .map_err(map_r2_error("delete data blob"))
    }

    async fn persist(&self, upload_id: &str) -> AppResult<()> {
        let staged = self.require_object(&staging_data_key(upload_id)).await?;
        let size = staged.size();
        let copy = FixedLengthStream::wrap(body_stream(&staged)?, size);

        self.bucket
            .put(durable_data_key(upload_id), Data::Stream(copy))
            .execute()
            .await
            .map(|_| ())
            .map_err(map_r2_error("persist data blob"))
    }

    async fn discard_persisted(&self, upload_id: &str) -> AppResult<()> {
        self.bucket
            .delete(durable_data_key(upload_id))
            .await
            .map_err(map_r2_error("discard persisted blob"))
    }
}

fn body_stream(object: &Object) -> AppResult<ByteStream> {
    object
        .body()
        .ok_or_else(|| AppError::StorageError {
            message: format!("blob {} has no body", object.key()),
        })?
        .stream()
        .map_err(map_r2_error("open blob stream"))
}

fn map_r2_error(operation: &'static str) -> impl Fn(worker::Error) -> AppError {
    move |err| AppError::StorageError {
        message: format!("{operation} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keys_separate_staging_from_durable_area() {
        assert_eq!(staging_data_key("blob-1"), "staging/blob-1/data");
        assert_eq!(staging_tmp_key("blob-1"), "staging/blob-1/tmp");
        assert_eq!(durable_data_key("blob-1"), "blob-1/data");
        assert!(!durable_data_key("blob-1").starts_with(STAGING_PREFIX));
    }
}
