//! Multipart transfer coordination
//!
//! Objects at or below the threshold move in one request. Larger objects are
//! split by [`plan_parts`] and pushed through a multipart session on a bounded
//! pool of in-flight parts:
//!
//! 1. CreateMultipartUpload
//! 2. UploadPart for every planned range, at most `concurrency` at a time
//! 3. CompleteMultipartUpload with the parts sorted ascending
//!
//! The first failing part cancels its siblings and aborts the session. Nothing
//! is retried.

pub mod gc;
pub mod plan;
pub mod session;

pub use gc::{abort_stale_uploads, abort_upload, list_stale_uploads, GcReport};
pub use plan::{plan_parts, TransferPart, MAX_PARTS};
pub use session::{MultipartSession, SessionState};

use crate::s3::chunk::{read_exact_part, ExactLengthReader, ShortBody};
use crate::s3::error::{Result, S3Error};
use crate::s3::signer::PayloadSigning;
use crate::s3::transport::BodyReader;
use crate::s3::S3Client;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

/// Multipart tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Part size in bytes (default: 5 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Objects larger than this use multipart (default: 100 MiB)
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Parts in flight at once (default: 10)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Signing policy for streamed part bodies
    #[serde(default)]
    pub payload_signing: PayloadSigning,
}

fn default_part_size() -> u64 {
    5 * 1024 * 1024
}

fn default_threshold() -> u64 {
    100 * 1024 * 1024
}

fn default_concurrency() -> usize {
    10
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            threshold: default_threshold(),
            concurrency: default_concurrency(),
            payload_signing: PayloadSigning::default(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            return Err(S3Error::InvalidConfig("part_size must be greater than zero".to_string()));
        }
        if self.concurrency == 0 {
            return Err(S3Error::InvalidConfig("concurrency must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    /// Set when the object went through a multipart session
    pub upload_id: Option<String>,
    /// 0 for a single-request transfer
    pub parts: usize,
}

impl TransferOutcome {
    fn single(bytes: u64, etag: Option<String>, version_id: Option<String>) -> Self {
        Self {
            bytes,
            etag,
            version_id,
            upload_id: None,
            parts: 0,
        }
    }
}

/// Where part bodies come from
enum PartSource<'a> {
    Local(&'a Bytes),
    Remote {
        client: &'a S3Client,
        bucket: &'a str,
        key: &'a str,
    },
}

impl PartSource<'_> {
    async fn open(&self, part: &TransferPart) -> Result<BodyReader> {
        match self {
            PartSource::Local(data) => {
                let slice = data.slice(part.start as usize..=part.end as usize);
                Ok(Box::pin(Cursor::new(slice)))
            }
            PartSource::Remote { client, bucket, key } => {
                let object = client.get_object_range(bucket, key, part.start, part.end).await?;
                Ok(Box::pin(ExactLengthReader::new(object.body, part.size())))
            }
        }
    }
}

/// Upload an in-memory object, as one PUT or as a multipart session.
pub async fn upload(
    target: &S3Client,
    bucket: &str,
    key: &str,
    data: Bytes,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    config.validate()?;
    let total = data.len() as u64;

    if total <= config.threshold {
        tracing::debug!(bucket, key, bytes = total, "single_put");
        let output = cancellable(cancel, target.put_object(bucket, key, data)).await?;
        return Ok(TransferOutcome::single(total, output.etag, output.version_id));
    }

    run_multipart(target, bucket, key, PartSource::Local(&data), total, config, cancel).await
}

/// Copy an object between two endpoints (or two locations on one endpoint).
///
/// Large objects are moved part by part: each part is a ranged GET on the
/// source streamed straight into UploadPart on the target.
#[allow(clippy::too_many_arguments)]
pub async fn copy(
    source: &S3Client,
    src_bucket: &str,
    src_key: &str,
    target: &S3Client,
    dst_bucket: &str,
    dst_key: &str,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    config.validate()?;

    let head = cancellable(cancel, source.head_object(src_bucket, src_key)).await?;
    let total = head.content_length;
    tracing::info!(
        src_bucket,
        src_key,
        dst_bucket,
        dst_key,
        bytes = total,
        "copy_started"
    );

    if total <= config.threshold {
        let data = cancellable(cancel, async {
            let object = source.get_object(src_bucket, src_key).await?;
            read_exact_part(object.body, total).await
        })
        .await?;
        let output = cancellable(cancel, target.put_object(dst_bucket, dst_key, data)).await?;
        return Ok(TransferOutcome::single(total, output.etag, output.version_id));
    }

    let parts = PartSource::Remote {
        client: source,
        bucket: src_bucket,
        key: src_key,
    };
    run_multipart(target, dst_bucket, dst_key, parts, total, config, cancel).await
}

async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(S3Error::Cancelled { upload_id: None, abort: None }),
        result = fut => result,
    }
}

async fn transfer_part(
    target: &S3Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    source: &PartSource<'_>,
    part: TransferPart,
) -> Result<String> {
    let body = source.open(&part).await?;
    target
        .upload_part(bucket, key, upload_id, part.part_number, body, part.size())
        .await
        .map_err(|e| {
            // Short source bodies arrive wrapped by whichever layer read them
            let short = ShortBody::find(&e).map(|short| short.to_string());
            match short {
                Some(message) => S3Error::decode(format!("part {} source: {}", part.part_number, message)),
                None => e,
            }
        })
}

async fn run_multipart(
    target: &S3Client,
    bucket: &str,
    key: &str,
    source: PartSource<'_>,
    total: u64,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    let parts = plan_parts(total, config.part_size)?;

    if cancel.is_cancelled() {
        return Err(S3Error::Cancelled {
            upload_id: None,
            abort: None,
        });
    }

    // A Create that has already answered wins over cancellation so the new
    // session can be aborted instead of leaked
    let init = tokio::select! {
        biased;
        result = target.create_multipart_upload(bucket, key) => result?,
        _ = cancel.cancelled() => {
            return Err(S3Error::Cancelled {
                upload_id: None,
                abort: None,
            });
        }
    };
    let mut session = MultipartSession::new(bucket, key, init.upload_id);
    let upload_id = session.upload_id().to_string();

    if cancel.is_cancelled() {
        tracing::info!(upload_id = %upload_id, "multipart_cancelled");
        let abort = abort_session(target, &mut session).await;
        return Err(S3Error::Cancelled {
            upload_id: Some(upload_id),
            abort,
        });
    }

    tracing::info!(
        bucket,
        key,
        upload_id = %upload_id,
        parts = parts.len(),
        concurrency = config.concurrency,
        "multipart_started"
    );

    // Cancelled by the caller's token, or by us on the first failure
    let siblings = cancel.child_token();
    let source = &source;
    let id = upload_id.as_str();

    let mut results = stream::iter(parts.iter().copied())
        .map(|part| {
            let token = siblings.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => (part.part_number, None),
                    result = transfer_part(target, bucket, key, id, source, part) => {
                        (part.part_number, Some(result))
                    }
                }
            }
        })
        .buffer_unordered(config.concurrency);

    let mut failure = None;
    while let Some((part_number, outcome)) = results.next().await {
        match outcome {
            Some(Ok(etag)) => {
                if let Err(e) = session.record_part(part_number, etag) {
                    failure = Some((part_number, e));
                    break;
                }
            }
            Some(Err(e)) => {
                failure = Some((part_number, e));
                break;
            }
            None => break,
        }
    }
    siblings.cancel();
    drop(results);

    if cancel.is_cancelled() {
        tracing::info!(upload_id = %upload_id, "multipart_cancelled");
        let abort = abort_session(target, &mut session).await;
        return Err(S3Error::Cancelled {
            upload_id: Some(upload_id),
            abort,
        });
    }

    if let Some((part_number, source)) = failure {
        tracing::warn!(
            upload_id = %upload_id,
            part_number,
            parts_done = session.part_count(),
            error = %source,
            "part_failed"
        );
        let abort = abort_session(target, &mut session).await;
        return Err(S3Error::PartUpload {
            part_number,
            upload_id,
            source: Box::new(source),
            abort,
        });
    }

    let completed = match session.completed_parts(parts.len()) {
        Ok(completed) => completed,
        Err(source) => {
            let abort = abort_session(target, &mut session).await;
            return Err(S3Error::CompleteFailed {
                upload_id,
                source: Box::new(source),
                abort,
            });
        }
    };

    match target
        .complete_multipart_upload(bucket, key, &upload_id, &completed)
        .await
    {
        Ok(result) => {
            session.mark_completed()?;
            tracing::info!(
                upload_id = %upload_id,
                parts = completed.len(),
                etag = %result.etag,
                "multipart_completed"
            );
            Ok(TransferOutcome {
                bytes: total,
                etag: Some(result.etag),
                version_id: result.version_id,
                upload_id: Some(upload_id),
                parts: completed.len(),
            })
        }
        Err(source) => {
            tracing::warn!(upload_id = %upload_id, error = %source, "complete_failed");
            let abort = abort_session(target, &mut session).await;
            Err(S3Error::CompleteFailed {
                upload_id,
                source: Box::new(source),
                abort,
            })
        }
    }
}

/// Best-effort abort; the returned error travels alongside the original one.
async fn abort_session(target: &S3Client, session: &mut MultipartSession) -> Option<Box<S3Error>> {
    let result = target
        .abort_multipart_upload(session.bucket(), session.key(), session.upload_id())
        .await;

    match result.and_then(|()| session.mark_aborted()) {
        Ok(()) => {
            tracing::info!(upload_id = %session.upload_id(), "multipart_aborted");
            None
        }
        Err(e) => {
            tracing::warn!(upload_id = %session.upload_id(), error = %e, "abort_failed");
            Some(Box::new(e))
        }
    }
}
