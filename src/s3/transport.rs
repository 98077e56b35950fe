//! HTTP executor seam
//!
//! The client only ever talks to an [`HttpExecutor`]. [`HyperExecutor`] is the
//! production implementation; tests plug in an in-memory server instead.

use crate::s3::error::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::{ReaderStream, StreamReader};

/// Readable byte stream used for streamed request and response bodies
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Outgoing request body
pub enum RequestBody {
    Empty,
    Full(Bytes),
    /// Streamed body of a known length
    Stream { reader: BodyReader, length: u64 },
}

impl RequestBody {
    pub fn stream(reader: impl AsyncRead + Send + 'static, length: u64) -> Self {
        RequestBody::Stream {
            reader: Box::pin(reader),
            length,
        }
    }

    pub fn content_length(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Full(bytes) => bytes.len() as u64,
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// Read the whole body into memory
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Full(bytes) => Ok(bytes),
            RequestBody::Stream { mut reader, length } => {
                let mut buf = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            RequestBody::Stream { length, .. } => write!(f, "Stream({} bytes)", length),
        }
    }
}

/// A fully signed request ready for the wire
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyReader,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyReader) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with an in-memory body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::new(status, headers, Box::pin(io::Cursor::new(body.into())))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Drain the body
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.body
            .read_to_end(&mut buf)
            .await
            .map_err(|e| TransportError::with_source("failed to read response body", e))?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// One HTTP round-trip. Implementations must not retry on their own.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

type WireBody = UnsyncBoxBody<Bytes, io::Error>;

/// hyper-util pooled client over native-tls
#[derive(Clone)]
pub struct HyperExecutor {
    client: HyperClient<HttpsConnector<HttpConnector>, WireBody>,
    timeout: Duration,
}

impl HyperExecutor {
    /// HTTP/1.1 with keep-alive pooling:
    /// - TCP_NODELAY enabled
    /// - 10s connect timeout
    /// - 90s TCP keepalive and idle-connection timeout
    pub fn new(insecure_tls: bool) -> std::result::Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| TransportError::with_source("failed to build TLS connector", e))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .retry_canceled_requests(false)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            timeout: Duration::from_secs(300),
        })
    }

    /// Time allowed until response headers arrive
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn wire_body(body: RequestBody) -> WireBody {
    match body {
        RequestBody::Empty => Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync(),
        RequestBody::Full(bytes) => Full::new(bytes)
            .map_err(|never| match never {})
            .boxed_unsync(),
        RequestBody::Stream { reader, .. } => {
            StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
        }
    }
}

#[async_trait]
impl HttpExecutor for HyperExecutor {
    async fn execute(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = Request::builder().method(method).uri(url.as_str());
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        let request = builder
            .body(wire_body(body))
            .map_err(|e| TransportError::with_source(format!("invalid request for {}", url), e))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::new(format!("request to {} timed out", url)))?
            .map_err(|e| TransportError::with_source(format!("request to {} failed", url), e))?;

        let (parts, incoming) = response.into_parts();
        let frames = TryStreamExt::map_err(BodyStream::new(incoming), io::Error::other)
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())));

        Ok(HttpResponse::new(
            parts.status,
            parts.headers,
            Box::pin(StreamReader::new(frames)),
        ))
    }
}
