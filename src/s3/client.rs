//! S3 client: endpoint builder + signer + executor + classifier
//!
//! Every operation makes exactly one round-trip and never retries.

use crate::s3::chunk::BoundedChunkReader;
use crate::s3::endpoint::{Endpoint, QueryParams};
use crate::s3::error::{classify, ProtocolError, Result, S3Error};
use crate::s3::signer::{payload_hash, Credentials, PayloadSigning, Signer, EMPTY_SHA256, UNSIGNED_PAYLOAD};
use crate::s3::transport::{BodyReader, HttpExecutor, HttpRequest, HttpResponse, RequestBody};
use crate::s3::types::{
    complete_multipart_body, CompleteMultipartUploadResult, CompletedPart,
    InitiateMultipartUploadResult, ListMultipartUploadsResult, ListPartsResult, ObjectMetadata,
    PutObjectOutput,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use std::fmt;
use std::sync::Arc;

/// Object body with the metadata from its response headers
pub struct GetObjectOutput {
    pub metadata: ObjectMetadata,
    pub body: BodyReader,
}

impl fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Filters and markers for ListMultipartUploads
#[derive(Debug, Clone, Default)]
pub struct ListUploadsQuery {
    pub prefix: Option<String>,
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub max_uploads: Option<u32>,
}

/// S3 client bound to one endpoint and one set of credentials.
///
/// Clones share the executor (and its connection pool) and the signer.
#[derive(Clone)]
pub struct S3Client {
    signer: Arc<Signer>,
    endpoint: Arc<Endpoint>,
    executor: Arc<dyn HttpExecutor>,
    payload_signing: PayloadSigning,
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("endpoint", &self.endpoint)
            .field("signer", &self.signer)
            .field("payload_signing", &self.payload_signing)
            .finish_non_exhaustive()
    }
}

impl S3Client {
    pub fn new(credentials: Credentials, endpoint: Endpoint, executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            signer: Arc::new(Signer::new(credentials)),
            endpoint: Arc::new(endpoint),
            executor,
            payload_signing: PayloadSigning::default(),
        }
    }

    /// How streamed bodies are signed
    pub fn with_payload_signing(mut self, payload_signing: PayloadSigning) -> Self {
        self.payload_signing = payload_signing;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credentials(&self) -> &Credentials {
        self.signer.credentials()
    }

    /// Build, sign, execute and classify one request.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &QueryParams,
        mut headers: HeaderMap,
        body: RequestBody,
    ) -> Result<HttpResponse> {
        let target = self.endpoint.target(Some(bucket), key, query);

        let (body, content_sha256) = match body {
            RequestBody::Empty => (RequestBody::Empty, EMPTY_SHA256.to_string()),
            RequestBody::Full(bytes) => {
                let hash = payload_hash(&bytes);
                (RequestBody::Full(bytes), hash)
            }
            stream @ RequestBody::Stream { .. } => match self.payload_signing {
                PayloadSigning::Unsigned => (stream, UNSIGNED_PAYLOAD.to_string()),
                PayloadSigning::Buffered => {
                    let bytes = stream.collect().await?;
                    let hash = payload_hash(&bytes);
                    (RequestBody::Full(bytes), hash)
                }
            },
        };

        // One instant for both the signature and x-amz-date
        let now = Utc::now();
        let signed = self.signer.sign_target(method.as_str(), &target, &content_sha256, &now);

        insert_header(&mut headers, "host", &target.host)?;
        insert_header(&mut headers, "x-amz-date", &signed.amz_date)?;
        insert_header(&mut headers, "x-amz-content-sha256", &signed.content_sha256)?;
        insert_header(&mut headers, "authorization", &signed.authorization)?;
        if let Some(token) = &signed.security_token {
            insert_header(&mut headers, "x-amz-security-token", token)?;
        }
        let has_body = !matches!(body, RequestBody::Empty);
        if has_body || method == Method::PUT || method == Method::POST {
            insert_header(&mut headers, "content-length", &body.content_length().to_string())?;
        }

        tracing::debug!(
            method = %method,
            url = %target.url,
            content_length = body.content_length(),
            "s3_request"
        );

        let response = self
            .executor
            .execute(HttpRequest {
                method,
                url: target.url,
                headers,
                body,
            })
            .await?;

        classify(response).await
    }

    /// HEAD an object
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let response = self
            .send(Method::HEAD, bucket, key, &QueryParams::new(), HeaderMap::new(), RequestBody::Empty)
            .await?;
        metadata_from_headers(&response)
    }

    /// GET a whole object; the body is streamed
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput> {
        let response = self
            .send(Method::GET, bucket, key, &QueryParams::new(), HeaderMap::new(), RequestBody::Empty)
            .await?;
        let metadata = metadata_from_headers(&response)?;
        Ok(GetObjectOutput {
            metadata,
            body: response.body,
        })
    }

    /// GET the inclusive byte range `[start, end]` of an object.
    ///
    /// A server that ignores `Range` and answers 200 with a different length is
    /// reported as a decode error rather than handing back the wrong bytes.
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<GetObjectOutput> {
        if end < start {
            return Err(S3Error::InvalidConfig(format!(
                "invalid byte range {}-{}",
                start, end
            )));
        }

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "range", &format!("bytes={}-{}", start, end))?;

        let response = self
            .send(Method::GET, bucket, key, &QueryParams::new(), headers, RequestBody::Empty)
            .await?;
        let metadata = metadata_from_headers(&response)?;

        let expected = end - start + 1;
        if metadata.content_length != expected {
            return Err(S3Error::Decode {
                status: Some(response.status),
                message: format!(
                    "range {}-{} returned {} bytes, expected {}",
                    start, end, metadata.content_length, expected
                ),
            });
        }
        if response.status != StatusCode::PARTIAL_CONTENT && start != 0 {
            return Err(S3Error::Decode {
                status: Some(response.status),
                message: format!("range {}-{} was not honoured", start, end),
            });
        }

        Ok(GetObjectOutput {
            metadata,
            body: response.body,
        })
    }

    /// Single buffered PUT, signed over the body, with `Content-MD5`
    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<PutObjectOutput> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "content-md5", &content_md5(&data))?;

        let response = self
            .send(Method::PUT, bucket, key, &QueryParams::new(), headers, RequestBody::Full(data))
            .await?;
        Ok(put_output(&response))
    }

    /// Single streamed PUT of exactly `length` bytes
    pub async fn put_object_stream(
        &self,
        bucket: &str,
        key: &str,
        body: BodyReader,
        length: u64,
    ) -> Result<PutObjectOutput> {
        let body = RequestBody::stream(BoundedChunkReader::new(body), length);
        let response = self
            .send(Method::PUT, bucket, key, &QueryParams::new(), HeaderMap::new(), body)
            .await?;
        Ok(put_output(&response))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_opt("versionId", version_id);

        self.send(Method::DELETE, bucket, key, &query, HeaderMap::new(), RequestBody::Empty)
            .await?;
        Ok(())
    }

    /// Initiate a multipart upload, returning the server-assigned upload ID
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<InitiateMultipartUploadResult> {
        let query = QueryParams::new().with("uploads", "");
        let response = self
            .send(Method::POST, bucket, key, &query, HeaderMap::new(), RequestBody::Empty)
            .await?;

        let body = response.bytes().await?;
        InitiateMultipartUploadResult::from_xml(&body)
    }

    /// Upload one part from a stream of exactly `length` bytes.
    ///
    /// Returns the part's ETag verbatim (quotes included).
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: BodyReader,
        length: u64,
    ) -> Result<String> {
        let query = QueryParams::new()
            .with("partNumber", part_number.to_string())
            .with("uploadId", upload_id);
        let body = RequestBody::stream(BoundedChunkReader::new(body), length);

        let response = self
            .send(Method::PUT, bucket, key, &query, HeaderMap::new(), body)
            .await?;

        let etag = response
            .header("etag")
            .filter(|etag| !etag.is_empty())
            .map(str::to_string)
            .ok_or_else(|| S3Error::Decode {
                status: Some(response.status),
                message: format!("UploadPart {} response has no ETag", part_number),
            })?;

        tracing::debug!(upload_id = %upload_id, part_number, etag = %etag, "part_uploaded");
        Ok(etag)
    }

    /// Complete a multipart upload. `parts` must already be in ascending order.
    ///
    /// S3 may report a completion failure as `200 OK` with an `<Error>` body;
    /// that is classified exactly like an error status.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResult> {
        let query = QueryParams::new().with("uploadId", upload_id);
        let xml = Bytes::from(complete_multipart_body(parts));

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "content-md5", &content_md5(&xml))?;
        insert_header(&mut headers, "content-type", "application/xml")?;

        let response = self
            .send(Method::POST, bucket, key, &query, headers, RequestBody::Full(xml))
            .await?;

        let status = response.status;
        let version_id = response.header("x-amz-version-id").map(str::to_string);
        let body = response.bytes().await?;
        if let Ok(error) = ProtocolError::from_xml(&body) {
            return Err(S3Error::Protocol { status, error });
        }

        let mut result = CompleteMultipartUploadResult::from_xml(&body)?;
        if version_id.is_some() {
            result.version_id = version_id;
        }
        Ok(result)
    }

    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let query = QueryParams::new().with("uploadId", upload_id);
        self.send(Method::DELETE, bucket, key, &query, HeaderMap::new(), RequestBody::Empty)
            .await?;
        Ok(())
    }

    /// One page of in-progress multipart uploads
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        params: &ListUploadsQuery,
    ) -> Result<ListMultipartUploadsResult> {
        let mut query = QueryParams::new().with("uploads", "");
        query.push_opt("prefix", params.prefix.as_deref());
        query.push_opt("key-marker", params.key_marker.as_deref());
        query.push_opt("upload-id-marker", params.upload_id_marker.as_deref());
        query.push_opt("max-uploads", params.max_uploads.map(|n| n.to_string()));

        let response = self
            .send(Method::GET, bucket, "", &query, HeaderMap::new(), RequestBody::Empty)
            .await?;

        let body = response.bytes().await?;
        ListMultipartUploadsResult::from_xml(&body)
    }

    /// One page of the parts uploaded so far
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<u32>,
    ) -> Result<ListPartsResult> {
        let mut query = QueryParams::new().with("uploadId", upload_id);
        query.push_opt("part-number-marker", part_number_marker.map(|n| n.to_string()));

        let response = self
            .send(Method::GET, bucket, key, &query, HeaderMap::new(), RequestBody::Empty)
            .await?;

        let body = response.bytes().await?;
        ListPartsResult::from_xml(&body)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| S3Error::InvalidConfig(format!("invalid {} header value: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

fn content_md5(data: &[u8]) -> String {
    BASE64.encode(md5::compute(data).0)
}

fn put_output(response: &HttpResponse) -> PutObjectOutput {
    PutObjectOutput {
        etag: response.header("etag").map(str::to_string),
        version_id: response.header("x-amz-version-id").map(str::to_string),
    }
}

fn metadata_from_headers(response: &HttpResponse) -> Result<ObjectMetadata> {
    let content_length = response
        .header("content-length")
        .ok_or_else(|| S3Error::Decode {
            status: Some(response.status),
            message: "response has no Content-Length".to_string(),
        })?
        .trim()
        .parse::<u64>()
        .map_err(|e| S3Error::Decode {
            status: Some(response.status),
            message: format!("invalid Content-Length: {}", e),
        })?;

    Ok(ObjectMetadata {
        content_length,
        etag: response.header("etag").map(str::to_string),
        version_id: response.header("x-amz-version-id").map(str::to_string),
        content_type: response.header("content-type").map(str::to_string),
        last_modified: response.header("last-modified").map(str::to_string),
    })
}
