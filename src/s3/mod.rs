//! S3 protocol client with AWS SigV4 signing
//!
//! This module provides:
//! - AWS Signature Version 4 signing over a fixed three-header canonical form
//! - Virtual-hosted endpoint and canonical query construction
//! - Object and multipart operations over a pluggable HTTP executor
//! - Typed error classification of every response

pub mod chunk;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod signer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{GetObjectOutput, ListUploadsQuery, S3Client};
pub use endpoint::{Endpoint, QueryParams, RequestTarget};
pub use error::{ProtocolError, Result, S3Error, TransportError};
pub use signer::{Credentials, PayloadSigning, Signer};
pub use transport::{BodyReader, HttpExecutor, HttpRequest, HttpResponse, HyperExecutor, RequestBody};
pub use types::{
    CompleteMultipartUploadResult, CompletedPart, InitiateMultipartUploadResult,
    ListMultipartUploadsResult, ListPartsResult, MultipartUpload, ObjectMetadata, Part,
    PutObjectOutput,
};
