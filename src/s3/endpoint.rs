//! Endpoint and request target construction
//!
//! A [`RequestTarget`] carries the wire URL together with the canonical path and
//! query the signer consumes. The URL is assembled from the canonical pieces, so
//! the two cannot drift apart.

use crate::s3::error::{Result, S3Error};
use url::Url;

/// Hex lookup table for percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// URI encode a string (RFC 3986 unreserved set kept, everything else `%XX`)
pub(crate) fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut result = String::with_capacity(s.len() + 16);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            b'/' if !encode_slash => {
                result.push('/');
            }
            _ => {
                result.push('%');
                result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
    result
}

/// Ordered query parameters.
///
/// Insertion order is kept for inspection; [`QueryParams::canonical`] always
/// sorts, so the order pairs were added in never reaches the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Add the pair only when a value is present
    pub fn push_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical query string: percent-encode every pair, drop empty keys,
    /// sort by encoded key then encoded value, join with `&`.
    pub fn canonical(&self) -> String {
        let mut encoded: Vec<(String, String)> = self
            .pairs
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();

        encoded.sort_unstable();

        let mut result = String::with_capacity(encoded.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
        for (i, (k, v)) in encoded.iter().enumerate() {
            if i > 0 {
                result.push('&');
            }
            result.push_str(k);
            result.push('=');
            result.push_str(v);
        }
        result
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// A fully resolved request destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Literal URL used for the wire request
    pub url: String,
    /// `Host` header value (bucket-prefixed, non-default port kept)
    pub host: String,
    pub canonical_path: String,
    pub canonical_query: String,
}

/// Base URL of an S3-compatible service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: Option<u16>,
    base_path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| S3Error::InvalidEndpoint(format!("{}: {}", raw, e)))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(S3Error::InvalidEndpoint(format!(
                "{}: unsupported scheme {:?}",
                raw, scheme
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| S3Error::InvalidEndpoint(format!("{}: missing host", raw)))?
            .to_string();

        if url.query().is_some() {
            return Err(S3Error::InvalidEndpoint(format!(
                "{}: endpoint must not carry a query",
                raw
            )));
        }

        Ok(Self {
            scheme,
            host,
            // url::Url reports None for the scheme's default port
            port: url.port(),
            base_path: url.path().trim_matches('/').to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolve a request destination. A bucket becomes a subdomain of the
    /// endpoint host; `key` is the object path inside it.
    pub fn target(&self, bucket: Option<&str>, key: &str, query: &QueryParams) -> RequestTarget {
        let mut host = match bucket.filter(|b| !b.is_empty()) {
            Some(bucket) => format!("{}.{}", bucket, self.host),
            None => self.host.clone(),
        };
        if let Some(port) = self.port {
            host.push(':');
            host.push_str(&port.to_string());
        }

        let canonical_path = canonical_path(&self.base_path, key);
        let canonical_query = query.canonical();

        let mut url = String::with_capacity(
            self.scheme.len() + 3 + host.len() + canonical_path.len() + canonical_query.len() + 1,
        );
        url.push_str(&self.scheme);
        url.push_str("://");
        url.push_str(&host);
        url.push_str(&canonical_path);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        RequestTarget {
            url,
            host,
            canonical_path,
            canonical_query,
        }
    }
}

/// Join base path and key into an encoded absolute path without empty segments.
/// A trailing `/` on a non-empty key is kept (directory-style keys).
fn canonical_path(base_path: &str, key: &str) -> String {
    let mut path = String::with_capacity(base_path.len() + key.len() + 8);
    for segment in base_path.split('/').chain(key.split('/')) {
        if segment.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(&uri_encode(segment, true));
    }

    if path.is_empty() {
        return "/".to_string();
    }
    if key.ends_with('/') {
        path.push('/');
    }
    path
}
