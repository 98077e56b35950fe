//! AWS Signature Version 4 signer for S3 requests
//!
//! The canonical form is fixed to three signed headers
//! (`host;x-amz-content-sha256;x-amz-date`). [`sign`] is the pure entry point;
//! [`Signer`] wraps it with credentials and a daily signing key cache.

use crate::s3::endpoint::RequestTarget;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SERVICE: &str = "s3";

/// Pre-computed SHA256 hash of empty payload
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DATE_FORMAT: &str = "%Y%m%d";

/// How streamed request bodies are represented in `x-amz-content-sha256`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSigning {
    /// Send `UNSIGNED-PAYLOAD` and stream the body as-is
    #[default]
    Unsigned,
    /// Read the body into memory, hash it and send a fully signed request
    Buffered,
}

/// Access credentials, immutable for the lifetime of a client
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
            region: region.into(),
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// Lowercase hex SHA-256 of a request body
pub fn payload_hash(payload: &[u8]) -> String {
    if payload.is_empty() {
        EMPTY_SHA256.to_string()
    } else {
        hex::encode(Sha256::digest(payload))
    }
}

/// `x-amz-date` value for a timestamp
pub fn amz_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIME_FORMAT).to_string()
}

fn date_stamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(DATE_FORMAT).to_string()
}

fn credential_scope(date: &str, region: &str) -> String {
    format!("{}/{}/{}/aws4_request", date, region, SERVICE)
}

/// Canonical request over the fixed three-header form
pub fn canonical_request(
    method: &str,
    host: &str,
    canonical_path: &str,
    canonical_query: &str,
    payload_hash: &str,
    amz_date: &str,
) -> String {
    let mut canonical_headers = String::with_capacity(host.len() + payload_hash.len() + 64);
    canonical_headers.push_str("host:");
    canonical_headers.push_str(host.trim());
    canonical_headers.push_str("\nx-amz-content-sha256:");
    canonical_headers.push_str(payload_hash);
    canonical_headers.push_str("\nx-amz-date:");
    canonical_headers.push_str(amz_date);
    canonical_headers.push('\n');

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_path, canonical_query, canonical_headers, SIGNED_HEADERS, payload_hash
    )
}

/// `AWS4-HMAC-SHA256\nTIMESTAMP\nSCOPE\nHEX(SHA256(canonical_request))`
pub fn string_to_sign(timestamp: &DateTime<Utc>, region: &str, canonical_request: &str) -> String {
    let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date(timestamp),
        credential_scope(&date_stamp(timestamp), region),
        canonical_request_hash
    )
}

/// Derive signing key from date stamp (4 chained HMAC operations)
pub fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str) -> [u8; 32] {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn authorization_header(access_key: &str, scope: &str, signature: &str) -> String {
    format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, access_key, scope, SIGNED_HEADERS, signature
    )
}

/// Compute the `Authorization` header value for a request.
///
/// Pure and deterministic: the same inputs always yield the same header.
#[allow(clippy::too_many_arguments)]
pub fn sign(
    method: &str,
    host: &str,
    canonical_path: &str,
    canonical_query: &str,
    payload_hash: &str,
    region: &str,
    access_key: &str,
    secret_key: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    let canonical = canonical_request(
        method,
        host,
        canonical_path,
        canonical_query,
        payload_hash,
        &amz_date(timestamp),
    );
    let to_sign = string_to_sign(timestamp, region, &canonical);
    let date = date_stamp(timestamp);
    let signing_key = derive_signing_key(secret_key, &date, region);
    let signature = hex::encode(hmac_sha256(&signing_key, to_sign.as_bytes()));
    authorization_header(access_key, &credential_scope(&date, region), &signature)
}

/// HMAC-SHA256 returning fixed-size array
fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Header values to place on the wire request, all derived from one timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
}

/// Credential-bound signer with a cached signing key per (date, region)
pub struct Signer {
    credentials: Credentials,
    cached_signing_key: Mutex<Option<(String, [u8; 32])>>,
}

impl Clone for Signer {
    fn clone(&self) -> Self {
        Self {
            credentials: self.credentials.clone(),
            // Each clone gets its own cache (populated on first use)
            cached_signing_key: Mutex::new(None),
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cached_signing_key: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Sign a built request target. `now` must be the same instant that ends up
    /// in the request's `x-amz-date` header; the returned value carries both.
    pub fn sign_target(
        &self,
        method: &str,
        target: &RequestTarget,
        payload_hash: &str,
        now: &DateTime<Utc>,
    ) -> SignedHeaders {
        let amz_date = amz_date(now);
        let date = date_stamp(now);
        let region = &self.credentials.region;

        let canonical = canonical_request(
            method,
            &target.host,
            &target.canonical_path,
            &target.canonical_query,
            payload_hash,
            &amz_date,
        );
        let to_sign = string_to_sign(now, region, &canonical);

        tracing::debug!(
            method = %method,
            canonical_request = %canonical,
            string_to_sign = %to_sign,
            "sigv4_sign"
        );

        let signing_key = self.signing_key(&date);
        let signature = hex::encode(hmac_sha256(&signing_key, to_sign.as_bytes()));

        SignedHeaders {
            authorization: authorization_header(
                &self.credentials.access_key,
                &credential_scope(&date, region),
                &signature,
            ),
            amz_date,
            content_sha256: payload_hash.to_string(),
            security_token: self.credentials.session_token.clone(),
        }
    }

    /// The signing key only changes daily; the region is fixed per signer.
    fn signing_key(&self, date: &str) -> [u8; 32] {
        let mut cache = match self.cached_signing_key.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached_date, key)) = cache.as_ref() {
            if cached_date == date {
                return *key;
            }
        }
        let key = derive_signing_key(&self.credentials.secret_key, date, &self.credentials.region);
        *cache = Some((date.to_string(), key));
        key
    }
}
