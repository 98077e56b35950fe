use crate::cli::{format_bytes, parse_query_pair, parse_s3_path};
use crate::core::Core;
use crate::s3::signer::{self, EMPTY_SHA256, UNSIGNED_PAYLOAD};
use crate::s3::QueryParams;
use crate::transfer::{self, TransferOutcome};
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn print_outcome(outcome: &TransferOutcome) {
    match &outcome.upload_id {
        Some(upload_id) => println!(
            "  {} in {} parts (upload {})",
            format_bytes(outcome.bytes),
            outcome.parts,
            upload_id
        ),
        None => println!("  {} in a single request", format_bytes(outcome.bytes)),
    }
    if let Some(etag) = &outcome.etag {
        println!("  etag {}", etag);
    }
}

/// Copy an object between profiles
pub async fn cmd_cp(
    core: &Core,
    source: &str,
    destination: &str,
    from_profile: Option<&str>,
    to_profile: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let src = parse_s3_path(source)?;
    let dst = parse_s3_path(destination)?;
    let src_key = src.key_or_err()?;
    // Copying into a "directory" keeps the source file name
    let dst_key = match dst.key.as_deref() {
        Some(key) if !key.ends_with('/') => key.to_string(),
        Some(prefix) => format!("{}{}", prefix, file_name(src_key)),
        None => file_name(src_key).to_string(),
    };

    let src_bucket = core.bucket(from_profile, src.bucket.as_deref())?;
    let dst_bucket = core.bucket(to_profile, dst.bucket.as_deref())?;
    let source_client = core.client(from_profile)?;
    let target_client = core.client(to_profile)?;

    println!(
        "s3://{}/{} -> s3://{}/{}",
        src_bucket, src_key, dst_bucket, dst_key
    );

    let outcome = transfer::copy(
        &source_client,
        &src_bucket,
        src_key,
        &target_client,
        &dst_bucket,
        &dst_key,
        &core.config.transfer,
        cancel,
    )
    .await?;

    print_outcome(&outcome);
    Ok(())
}

/// Upload a local file
pub async fn cmd_put(
    core: &Core,
    local: &Path,
    destination: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let dst = parse_s3_path(destination)?;
    let local_name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} is not a file", local.display()))?;
    let key = match dst.key.as_deref() {
        Some(key) if !key.ends_with('/') => key.to_string(),
        Some(prefix) => format!("{}{}", prefix, local_name),
        None => local_name.to_string(),
    };

    let data = tokio::fs::read(local)
        .await
        .with_context(|| format!("Failed to read {}", local.display()))?;

    let bucket = core.bucket(None, dst.bucket.as_deref())?;
    println!("{} -> s3://{}/{}", local.display(), bucket, key);

    let client = core.client(None)?;
    let outcome = transfer::upload(
        &client,
        &bucket,
        &key,
        Bytes::from(data),
        &core.config.transfer,
        cancel,
    )
    .await?;

    print_outcome(&outcome);
    Ok(())
}

/// List in-progress multipart uploads
pub async fn cmd_uploads(core: &Core, path: &str) -> Result<()> {
    let path = parse_s3_path(path)?;
    let bucket = core.bucket(None, path.bucket.as_deref())?;
    let client = core.client(None)?;

    let uploads = transfer::list_stale_uploads(&client, &bucket, path.key.as_deref()).await?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    for upload in &uploads {
        writeln!(
            out,
            "{:<24}  {}  {}",
            upload.initiated.as_deref().unwrap_or("-"),
            upload.upload_id,
            upload.key
        )?;
    }
    writeln!(out, "{} in-progress upload(s)", uploads.len())?;
    out.flush()?;
    Ok(())
}

/// Abort one upload, or every upload older than a cut-off
pub async fn cmd_gc(
    core: &Core,
    path: &str,
    upload_id: Option<&str>,
    older_than_hours: Option<u64>,
) -> Result<()> {
    let path = parse_s3_path(path)?;
    let bucket = core.bucket(None, path.bucket.as_deref())?;
    let client = core.client(None)?;

    if let Some(upload_id) = upload_id {
        let key = path.key_or_err()?;
        transfer::abort_upload(&client, &bucket, key, upload_id).await?;
        println!("aborted {} ({})", upload_id, key);
        return Ok(());
    }

    let cutoff = older_than_hours
        .map(|hours| {
            i64::try_from(hours)
                .ok()
                .and_then(Duration::try_hours)
                .map(|age| Utc::now() - age)
                .ok_or_else(|| anyhow::anyhow!("--older-than-hours {} is out of range", hours))
        })
        .transpose()?;

    let report = transfer::abort_stale_uploads(&client, &bucket, cutoff).await?;

    for upload in &report.aborted {
        println!("aborted  {}  {}", upload.upload_id, upload.key);
    }
    for upload in &report.skipped {
        println!("skipped  {}  {} (unknown initiation time)", upload.upload_id, upload.key);
    }
    for (upload, error) in &report.failed {
        println!("FAILED   {}  {}: {}", upload.upload_id, upload.key, error);
    }

    if !report.failed.is_empty() {
        anyhow::bail!(
            "{} of {} aborts failed",
            report.failed.len(),
            report.failed.len() + report.aborted.len()
        );
    }
    Ok(())
}

/// Print the canonical request and Authorization header for a request
pub async fn cmd_sign(
    core: &Core,
    method: &str,
    path: &str,
    query: &[String],
    payload: Option<&Path>,
    unsigned: bool,
    timestamp: Option<&str>,
) -> Result<()> {
    let path = parse_s3_path(path)?;
    let bucket = core.bucket(None, path.bucket.as_deref())?;
    let profile = core.profile(None)?;
    let endpoint = crate::s3::Endpoint::parse(&profile.endpoint)
        .with_context(|| format!("Invalid endpoint in profile: {}", profile.endpoint))?;

    let query = query
        .iter()
        .map(|raw| parse_query_pair(raw))
        .collect::<Result<QueryParams>>()?;
    let target = endpoint.target(Some(&bucket), path.key.as_deref().unwrap_or(""), &query);

    let payload_hash = match (payload, unsigned) {
        (_, true) => UNSIGNED_PAYLOAD.to_string(),
        (Some(file), false) => {
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            signer::payload_hash(&data)
        }
        (None, false) => EMPTY_SHA256.to_string(),
    };

    let now = match timestamp {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid --timestamp {:?}", raw))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let method = method.to_ascii_uppercase();
    let credentials = profile.credentials();
    let canonical = signer::canonical_request(
        &method,
        &target.host,
        &target.canonical_path,
        &target.canonical_query,
        &payload_hash,
        &signer::amz_date(&now),
    );
    let authorization = signer::sign(
        &method,
        &target.host,
        &target.canonical_path,
        &target.canonical_query,
        &payload_hash,
        &credentials.region,
        &credentials.access_key,
        &credentials.secret_key,
        &now,
    );

    println!("URL: {}", target.url);
    println!();
    println!("Canonical request:\n{}", canonical);
    println!();
    println!(
        "String to sign:\n{}",
        signer::string_to_sign(&now, &credentials.region, &canonical)
    );
    println!();
    println!("host: {}", target.host);
    println!("x-amz-date: {}", signer::amz_date(&now));
    println!("x-amz-content-sha256: {}", payload_hash);
    if let Some(token) = &credentials.session_token {
        println!("x-amz-security-token: {}", token);
    }
    println!("authorization: {}", authorization);
    Ok(())
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
