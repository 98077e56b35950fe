//! Error taxonomy for S3 round-trips
//!
//! Every response passes through [`classify`] before its body is touched:
//! - status < 300: handed back untouched
//! - status >= 300 with a parsable `<Error>` body: [`S3Error::Protocol`]
//! - status >= 300 with anything else: [`S3Error::Decode`]
//!
//! Nothing here retries. Transport failures surface as [`S3Error::Transport`].

use crate::s3::transport::HttpResponse;
use crate::s3::types::{for_each_element, Tag};
use hyper::StatusCode;
use std::fmt;
use thiserror::Error;

/// Uniform S3 error body: `<Error><Code/><Message/><Resource/><RequestId/></Error>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
    pub resource: String,
    pub request_id: String,
}

impl ProtocolError {
    /// Parse an `<Error>` document. Fails when the root element is not `Error`
    /// or no `Code` is present.
    pub fn from_xml(xml: &[u8]) -> std::result::Result<Self, String> {
        let mut error = ProtocolError::default();
        let mut saw_root = false;

        for_each_element(xml, |tag, text| match tag {
            Tag::Open(b"Error") => saw_root = true,
            Tag::Close(b"Code") => error.code = std::mem::take(text),
            Tag::Close(b"Message") => error.message = std::mem::take(text),
            Tag::Close(b"Resource") => error.resource = std::mem::take(text),
            Tag::Close(b"RequestId") => error.request_id = std::mem::take(text),
            _ => {}
        })?;

        if !saw_root {
            return Err("response body is not an <Error> document".to_string());
        }
        if error.code.is_empty() {
            return Err("<Error> document has no <Code>".to_string());
        }
        Ok(error)
    }

    /// Synthesize an error for a bodiless failure (HEAD responses carry no body).
    fn from_status(status: StatusCode) -> Self {
        let code = match status {
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::PRECONDITION_FAILED => "PreconditionFailed",
            StatusCode::NOT_MODIFIED => "NotModified",
            StatusCode::MOVED_PERMANENTLY => "PermanentRedirect",
            _ => status.as_str(),
        };
        Self {
            code: code.to_string(),
            message: status.canonical_reason().unwrap_or_default().to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The HTTP executor failed to complete the round-trip
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// S3 client errors
#[derive(Error, Debug)]
pub enum S3Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("S3 error: {status} - {error}")]
    Protocol {
        status: StatusCode,
        error: ProtocolError,
    },

    #[error("decode error{}: {message}", status_suffix(.status))]
    Decode {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("part {part_number} of upload {upload_id} failed: {source}{}", abort_suffix(.abort))]
    PartUpload {
        part_number: u32,
        upload_id: String,
        #[source]
        source: Box<S3Error>,
        abort: Option<Box<S3Error>>,
    },

    #[error("completing upload {upload_id} failed: {source}{}", abort_suffix(.abort))]
    CompleteFailed {
        upload_id: String,
        #[source]
        source: Box<S3Error>,
        abort: Option<Box<S3Error>>,
    },

    #[error("transfer cancelled{}{}", upload_suffix(.upload_id, .abort), abort_suffix(.abort))]
    Cancelled {
        upload_id: Option<String>,
        abort: Option<Box<S3Error>>,
    },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_suffix(status: &Option<StatusCode>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

fn abort_suffix(abort: &Option<Box<S3Error>>) -> String {
    abort
        .as_ref()
        .map(|e| format!("; abort also failed: {e}"))
        .unwrap_or_default()
}

fn upload_suffix(upload_id: &Option<String>, abort: &Option<Box<S3Error>>) -> String {
    match (upload_id, abort) {
        (Some(id), None) => format!(" (upload {id} aborted)"),
        (Some(id), Some(_)) => format!(" (upload {id})"),
        (None, _) => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, S3Error>;

impl S3Error {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        S3Error::Decode {
            status: None,
            message: message.into(),
        }
    }

    /// The S3 error code, when the server supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            S3Error::Protocol { error, .. } => Some(&error.code),
            S3Error::PartUpload { source, .. } | S3Error::CompleteFailed { source, .. } => {
                source.code()
            }
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            S3Error::Protocol { status, .. } => Some(*status),
            S3Error::Decode { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code(),
            Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound")
        )
    }
}

/// Turn an error status and body into a typed error
pub fn classify_error_body(status: StatusCode, body: &[u8]) -> S3Error {
    if body.iter().all(u8::is_ascii_whitespace) {
        return S3Error::Protocol {
            status,
            error: ProtocolError::from_status(status),
        };
    }

    match ProtocolError::from_xml(body) {
        Ok(error) => S3Error::Protocol { status, error },
        Err(reason) => S3Error::Decode {
            status: Some(status),
            message: format!(
                "unreadable error body ({reason}): {}",
                String::from_utf8_lossy(&body[..body.len().min(256)])
            ),
        },
    }
}

/// Pass successful responses through; drain and classify the rest.
pub async fn classify(response: HttpResponse) -> Result<HttpResponse> {
    if response.status.as_u16() < 300 {
        return Ok(response);
    }

    let status = response.status;
    let body = response.bytes().await?;
    let err = classify_error_body(status, &body);
    tracing::debug!(status = %status, error = %err, "s3_request_failed");
    Err(err)
}
