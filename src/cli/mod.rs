//! CLI module for s3xfer
//!
//! # Usage
//!
//! ```bash
//! # Copy between two profiles (multipart above the threshold)
//! s3xfer cp s3://src-bucket/big.bin s3://dst-bucket/big.bin --from aws --to minio
//!
//! # Upload a local file
//! s3xfer put ./backup.tar s3://bucket/backups/backup.tar
//!
//! # List and clean up abandoned multipart uploads
//! s3xfer uploads s3://bucket/backups/
//! s3xfer gc s3://bucket --older-than-hours 24
//!
//! # Show how a request would be signed
//! s3xfer sign GET s3://bucket/key --query versionId=abc
//!
//! # An empty bucket (s3:///key) means the profile's default bucket
//! s3xfer put ./report.csv s3:///reports/
//! ```

pub mod commands;

use anyhow::Result;

/// `s3://bucket/key` (or mc-style `s3/bucket/key`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Path {
    /// `None` selects the profile's default bucket
    pub bucket: Option<String>,
    pub key: Option<String>,
}

impl S3Path {
    pub fn key_or_err(&self) -> Result<&str> {
        self.key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "S3 path s3://{} must include a key",
                self.bucket.as_deref().unwrap_or_default()
            )
        })
    }
}

/// Parse an S3 path into bucket and optional key
pub fn parse_s3_path(path: &str) -> Result<S3Path> {
    let path = path.trim();

    // Accept both "s3://bucket/key" (URI) and "s3/bucket/key" (mc-compatible)
    let stripped = if let Some(p) = path.strip_prefix("s3://") {
        p
    } else if let Some(p) = path.strip_prefix("s3/") {
        p
    } else {
        anyhow::bail!("Invalid S3 path format. Expected: s3://bucket/key");
    };

    let (bucket, key) = match stripped.split_once('/') {
        Some((bucket, key)) => (bucket, Some(key)),
        None => (stripped, None),
    };

    Ok(S3Path {
        bucket: Some(bucket).filter(|b| !b.is_empty()).map(str::to_string),
        key: key.filter(|k| !k.is_empty()).map(str::to_string),
    })
}

/// Parse a `key=value` query argument (`key` alone means an empty value)
pub fn parse_query_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw.split_once('=').unwrap_or((raw, ""));
    if key.is_empty() {
        anyhow::bail!("Query parameter {:?} has no key", raw);
    }
    Ok((key.to_string(), value.to_string()))
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[exponent])
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}
