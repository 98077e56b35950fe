//! Listing and aborting abandoned multipart sessions

use crate::s3::client::ListUploadsQuery;
use crate::s3::error::{Result, S3Error};
use crate::s3::types::MultipartUpload;
use crate::s3::S3Client;
use chrono::{DateTime, Utc};

/// Per-session outcome of [`abort_stale_uploads`]
#[derive(Debug, Default)]
pub struct GcReport {
    pub aborted: Vec<MultipartUpload>,
    pub failed: Vec<(MultipartUpload, S3Error)>,
    /// Sessions whose initiation time could not be read, left alone
    pub skipped: Vec<MultipartUpload>,
}

/// Every in-progress multipart upload in `bucket`, following pagination.
pub async fn list_stale_uploads(
    client: &S3Client,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Vec<MultipartUpload>> {
    let mut query = ListUploadsQuery {
        prefix: prefix.map(str::to_string),
        ..ListUploadsQuery::default()
    };
    let mut uploads = Vec::new();

    loop {
        let page = client.list_multipart_uploads(bucket, &query).await?;
        tracing::debug!(
            bucket,
            count = page.uploads.len(),
            truncated = page.is_truncated,
            "list_uploads_page"
        );
        uploads.extend(page.uploads);

        if !page.is_truncated {
            break;
        }

        let next_key = page.next_key_marker;
        let next_upload = page.next_upload_id_marker;
        if next_key.is_none() && next_upload.is_none() {
            return Err(S3Error::decode(
                "truncated ListMultipartUploads page carries no next markers",
            ));
        }
        if next_key == query.key_marker && next_upload == query.upload_id_marker {
            return Err(S3Error::decode(format!(
                "ListMultipartUploads pagination did not advance past {:?}/{:?}",
                next_key, next_upload
            )));
        }
        query.key_marker = next_key;
        query.upload_id_marker = next_upload;
    }

    Ok(uploads)
}

/// Abort one session
pub async fn abort_upload(client: &S3Client, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
    client.abort_multipart_upload(bucket, key, upload_id).await?;
    tracing::info!(bucket, key, upload_id, "upload_aborted");
    Ok(())
}

/// Abort every session initiated before `older_than` (all sessions when
/// `None`). A failed abort is recorded and the sweep moves on.
pub async fn abort_stale_uploads(
    client: &S3Client,
    bucket: &str,
    older_than: Option<DateTime<Utc>>,
) -> Result<GcReport> {
    let uploads = list_stale_uploads(client, bucket, None).await?;
    let mut report = GcReport::default();

    for upload in uploads {
        if let Some(cutoff) = older_than {
            match initiated_at(&upload) {
                Some(initiated) if initiated < cutoff => {}
                Some(_) => continue,
                None => {
                    tracing::warn!(
                        bucket,
                        key = %upload.key,
                        upload_id = %upload.upload_id,
                        initiated = ?upload.initiated,
                        "upload_initiated_unreadable"
                    );
                    report.skipped.push(upload);
                    continue;
                }
            }
        }

        match abort_upload(client, bucket, &upload.key, &upload.upload_id).await {
            Ok(()) => report.aborted.push(upload),
            Err(e) => {
                tracing::warn!(
                    bucket,
                    key = %upload.key,
                    upload_id = %upload.upload_id,
                    error = %e,
                    "gc_abort_failed"
                );
                report.failed.push((upload, e));
            }
        }
    }

    tracing::info!(
        bucket,
        aborted = report.aborted.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "gc_finished"
    );
    Ok(report)
}

fn initiated_at(upload: &MultipartUpload) -> Option<DateTime<Utc>> {
    let raw = upload.initiated.as_deref()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
