//! In-memory S3 server used by the integration tests.
//!
//! Every request has its SigV4 signature recomputed and checked; a mismatch is
//! answered with `403 SignatureDoesNotMatch` so a signing bug fails loudly.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use s3xfer::s3::signer::{self, UNSIGNED_PAYLOAD};
use s3xfer::s3::{Credentials, Endpoint, HttpExecutor, HttpRequest, HttpResponse, S3Client, TransportError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ACCESS_KEY: &str = "AKIAFAKE";
pub const SECRET_KEY: &str = "fake/secret";
pub const REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct FakeUpload {
    pub bucket: String,
    pub key: String,
    pub initiated: String,
    pub parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), Bytes>,
    uploads: BTreeMap<String, FakeUpload>,
    next_upload: usize,
    calls: Vec<String>,
    completed_parts: Vec<Vec<u32>>,
    completion_order: Vec<u32>,
}

/// Failure, latency and response knobs
#[derive(Default)]
pub struct Faults {
    pub fail_part: Option<u32>,
    /// Ranged GETs advertise the full length but send one byte less
    pub truncate_ranges: bool,
    /// Returned as `x-amz-version-id` by CompleteMultipartUpload
    pub version_id: Option<String>,
    /// Cancelled while CreateMultipartUpload is being answered
    pub cancel_on_create: Option<CancellationToken>,
    pub fail_complete: bool,
    pub fail_abort: bool,
    pub fail_abort_ids: HashSet<String>,
    pub part_delays: HashMap<u32, Duration>,
    pub page_size: Option<usize>,
}

pub struct FakeS3 {
    host: String,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeS3 {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn client(self: &Arc<Self>) -> S3Client {
        S3Client::new(
            Credentials::new(ACCESS_KEY, SECRET_KEY, REGION),
            Endpoint::parse(&format!("http://{}", self.host)).unwrap(),
            self.clone(),
        )
    }

    pub fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap()
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Register an in-progress upload directly
    pub fn seed_upload(&self, bucket: &str, key: &str, upload_id: &str, initiated: &str) {
        self.state.lock().unwrap().uploads.insert(
            upload_id.to_string(),
            FakeUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                initiated: initiated.to_string(),
                parts: BTreeMap::new(),
            },
        );
    }

    pub fn uploads(&self) -> Vec<FakeUpload> {
        self.state.lock().unwrap().uploads.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Part numbers of every CompleteMultipartUpload body, in submission order
    pub fn completed_parts(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().completed_parts.clone()
    }

    /// Order in which UploadPart requests finished
    pub fn completion_order(&self) -> Vec<u32> {
        self.state.lock().unwrap().completion_order.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn verify_signature(&self, request: &HttpRequest, host: &str, path: &str, query: &str, body: &[u8]) -> Option<HttpResponse> {
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let content_sha256 = header("x-amz-content-sha256");
        if content_sha256 != UNSIGNED_PAYLOAD && content_sha256 != signer::payload_hash(body) {
            return Some(error(StatusCode::BAD_REQUEST, "XAmzContentSHA256Mismatch"));
        }
        if header("host") != host {
            return Some(error(StatusCode::BAD_REQUEST, "InvalidHost"));
        }

        let amz_date = header("x-amz-date");
        let Ok(now) = NaiveDateTime::parse_from_str(&amz_date, "%Y%m%dT%H%M%SZ") else {
            return Some(error(StatusCode::FORBIDDEN, "AccessDenied"));
        };
        let now: DateTime<Utc> = DateTime::from_naive_utc_and_offset(now, Utc);

        let expected = signer::sign(
            request.method.as_str(),
            host,
            path,
            query,
            &content_sha256,
            REGION,
            ACCESS_KEY,
            SECRET_KEY,
            &now,
        );
        if header("authorization") != expected {
            return Some(error(StatusCode::FORBIDDEN, "SignatureDoesNotMatch"));
        }
        None
    }

    async fn handle(&self, request: HttpRequest, body: Bytes) -> HttpResponse {
        let url = url::Url::parse(&request.url).unwrap();
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap(), port),
            None => url.host_str().unwrap().to_string(),
        };
        let path = url.path().to_string();
        let raw_query = url.query().unwrap_or("").to_string();

        if let Some(rejected) = self.verify_signature(&request, &host, &path, &raw_query, &body) {
            return rejected;
        }

        let bucket = host
            .strip_suffix(&format!(".{}", self.host))
            .unwrap_or_default()
            .to_string();
        let key = percent_decode(path.trim_start_matches('/'));
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        match (&request.method, query.contains_key("uploads"), query.get("uploadId")) {
            (&Method::POST, true, _) => self.create(&bucket, &key),
            (&Method::GET, true, _) => self.list_uploads(&bucket, &query),
            (&Method::PUT, _, Some(upload_id)) => {
                let part_number: u32 = query["partNumber"].parse().unwrap();
                self.upload_part(upload_id, part_number, body).await
            }
            (&Method::POST, _, Some(upload_id)) => self.complete(upload_id, &body),
            (&Method::DELETE, _, Some(upload_id)) => self.abort(upload_id),
            (&Method::GET, _, Some(upload_id)) => self.list_parts(upload_id),
            (&Method::HEAD, _, _) => self.head(&bucket, &key),
            (&Method::GET, _, _) => {
                let range = request
                    .headers
                    .get("range")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                self.get(&bucket, &key, range.as_deref())
            }
            (&Method::PUT, _, None) => self.put_object(&request, &bucket, &key, body),
            (&Method::DELETE, _, None) => {
                self.record(format!("DELETE object {}", key));
                self.state
                    .lock()
                    .unwrap()
                    .objects
                    .remove(&(bucket, key));
                response(StatusCode::NO_CONTENT, &[], "")
            }
            _ => error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        }
    }

    fn create(&self, bucket: &str, key: &str) -> HttpResponse {
        if let Some(token) = self.faults().cancel_on_create.take() {
            token.cancel();
        }
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.calls.push(format!("POST create {}", key));
        state.uploads.insert(
            upload_id.clone(),
            FakeUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                initiated: Utc::now().to_rfc3339(),
                parts: BTreeMap::new(),
            },
        );
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            bucket, key, upload_id
        );
        response(StatusCode::OK, &[], xml)
    }

    async fn upload_part(&self, upload_id: &str, part_number: u32, body: Bytes) -> HttpResponse {
        self.record(format!("PUT part {}", part_number));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.faults().part_delays.get(&part_number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.faults().fail_part == Some(part_number) {
            return error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
        }

        let etag = format!("\"{:x}\"", md5::compute(&body));
        let mut state = self.state.lock().unwrap();
        let Some(upload) = state.uploads.get_mut(upload_id) else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload");
        };
        upload.parts.insert(part_number, (etag.clone(), body));
        state.completion_order.push(part_number);
        response(StatusCode::OK, &[("etag", etag)], "")
    }

    fn complete(&self, upload_id: &str, body: &[u8]) -> HttpResponse {
        self.record("POST complete".to_string());
        let submitted = parse_complete_body(std::str::from_utf8(body).unwrap());

        let mut state = self.state.lock().unwrap();
        state
            .completed_parts
            .push(submitted.iter().map(|(n, _)| *n).collect());

        if self.faults().fail_complete {
            return response(
                StatusCode::OK,
                &[],
                "<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>",
            );
        }

        let Some(upload) = state.uploads.get(upload_id).cloned() else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload");
        };

        let mut assembled = Vec::new();
        for (i, (number, etag)) in submitted.iter().enumerate() {
            if *number as usize != i + 1 {
                return error(StatusCode::BAD_REQUEST, "InvalidPartOrder");
            }
            match upload.parts.get(number) {
                Some((stored, data)) if stored == etag => assembled.extend_from_slice(data),
                _ => return error(StatusCode::BAD_REQUEST, "InvalidPart"),
            }
        }

        state.uploads.remove(upload_id);
        state
            .objects
            .insert((upload.bucket.clone(), upload.key.clone()), Bytes::from(assembled));

        let xml = format!(
            "<CompleteMultipartUploadResult><Location>http://{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>\"multipart-{}\"</ETag></CompleteMultipartUploadResult>",
            self.host,
            upload.key,
            upload.bucket,
            upload.key,
            submitted.len()
        );
        let headers: Vec<(&'static str, String)> = self
            .faults()
            .version_id
            .clone()
            .map(|v| ("x-amz-version-id", v))
            .into_iter()
            .collect();
        response(StatusCode::OK, &headers, xml)
    }

    fn abort(&self, upload_id: &str) -> HttpResponse {
        self.record(format!("DELETE abort {}", upload_id));
        {
            let faults = self.faults();
            if faults.fail_abort || faults.fail_abort_ids.contains(upload_id) {
                return error(StatusCode::SERVICE_UNAVAILABLE, "SlowDown");
            }
        }
        match self.state.lock().unwrap().uploads.remove(upload_id) {
            Some(_) => response(StatusCode::NO_CONTENT, &[], ""),
            None => error(StatusCode::NOT_FOUND, "NoSuchUpload"),
        }
    }

    fn list_uploads(&self, bucket: &str, query: &HashMap<String, String>) -> HttpResponse {
        self.record("GET uploads".to_string());
        let page_size = self.faults().page_size.unwrap_or(1000);
        let prefix = query.get("prefix").cloned().unwrap_or_default();
        let key_marker = query.get("key-marker").cloned().unwrap_or_default();
        let id_marker = query.get("upload-id-marker").cloned().unwrap_or_default();

        let state = self.state.lock().unwrap();
        let mut matching: Vec<(&String, &FakeUpload)> = state
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket && u.key.starts_with(&prefix))
            .filter(|(id, u)| (u.key.as_str(), id.as_str()) > (key_marker.as_str(), id_marker.as_str()))
            .collect();
        matching.sort_by(|a, b| (&a.1.key, a.0).cmp(&(&b.1.key, b.0)));

        let truncated = matching.len() > page_size;
        matching.truncate(page_size);

        let mut xml = format!(
            "<ListMultipartUploadsResult><Bucket>{}</Bucket><IsTruncated>{}</IsTruncated>",
            bucket, truncated
        );
        if truncated {
            if let Some((id, upload)) = matching.last() {
                xml.push_str(&format!(
                    "<NextKeyMarker>{}</NextKeyMarker><NextUploadIdMarker>{}</NextUploadIdMarker>",
                    upload.key, id
                ));
            }
        }
        for (id, upload) in &matching {
            xml.push_str(&format!(
                "<Upload><Key>{}</Key><UploadId>{}</UploadId><Initiated>{}</Initiated></Upload>",
                upload.key, id, upload.initiated
            ));
        }
        xml.push_str("</ListMultipartUploadsResult>");
        response(StatusCode::OK, &[], xml)
    }

    fn list_parts(&self, upload_id: &str) -> HttpResponse {
        self.record("GET parts".to_string());
        let state = self.state.lock().unwrap();
        let Some(upload) = state.uploads.get(upload_id) else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload");
        };

        let mut xml = format!(
            "<ListPartsResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId><IsTruncated>false</IsTruncated>",
            upload.bucket, upload.key, upload_id
        );
        for (number, (etag, data)) in &upload.parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag><Size>{}</Size></Part>",
                number,
                etag.replace('"', "&quot;"),
                data.len()
            ));
        }
        xml.push_str("</ListPartsResult>");
        response(StatusCode::OK, &[], xml)
    }

    fn head(&self, bucket: &str, key: &str) -> HttpResponse {
        self.record(format!("HEAD {}", key));
        match self.object(bucket, key) {
            Some(data) => response(
                StatusCode::OK,
                &[("content-length", data.len().to_string())],
                "",
            ),
            None => response(StatusCode::NOT_FOUND, &[], ""),
        }
    }

    fn get(&self, bucket: &str, key: &str, range: Option<&str>) -> HttpResponse {
        let Some(data) = self.object(bucket, key) else {
            self.record(format!("GET {}", key));
            return error(StatusCode::NOT_FOUND, "NoSuchKey");
        };

        match range.and_then(|r| r.strip_prefix("bytes=")) {
            Some(bytes_range) => {
                self.record(format!("GET range {}", bytes_range));
                let (start, end) = bytes_range.split_once('-').unwrap();
                let start: usize = start.parse().unwrap();
                let end: usize = end.parse::<usize>().unwrap().min(data.len() - 1);
                let slice = data.slice(start..=end);
                let length = slice.len().to_string();
                let body = if self.faults().truncate_ranges {
                    slice.slice(..slice.len() - 1)
                } else {
                    slice
                };
                response(StatusCode::PARTIAL_CONTENT, &[("content-length", length)], body)
            }
            None => {
                self.record(format!("GET {}", key));
                response(
                    StatusCode::OK,
                    &[("content-length", data.len().to_string())],
                    data,
                )
            }
        }
    }

    fn put_object(&self, request: &HttpRequest, bucket: &str, key: &str, body: Bytes) -> HttpResponse {
        self.record(format!("PUT object {}", key));
        if let Some(md5_header) = request.headers.get("content-md5") {
            use base64::Engine;
            let expected = base64::engine::general_purpose::STANDARD.encode(md5::compute(&body).0);
            if md5_header.to_str().unwrap_or_default() != expected {
                return error(StatusCode::BAD_REQUEST, "BadDigest");
            }
        }
        let etag = format!("\"{:x}\"", md5::compute(&body));
        self.put(bucket, key, body);
        response(StatusCode::OK, &[("etag", etag)], "")
    }
}

#[async_trait]
impl HttpExecutor for FakeS3 {
    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let body = std::mem::replace(&mut request.body, s3xfer::s3::RequestBody::Empty)
            .collect()
            .await
            .map_err(|e| TransportError::with_source("reading request body", e))?;
        Ok(self.handle(request, body).await)
    }
}

fn response(status: StatusCode, headers: &[(&'static str, String)], body: impl Into<Bytes>) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(HeaderName::from_static(name), HeaderValue::from_str(value).unwrap());
    }
    HttpResponse::from_bytes(status, map, body)
}

fn error(status: StatusCode, code: &str) -> HttpResponse {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{} from fake</Message><RequestId>fake-1</RequestId></Error>",
        code, code
    );
    response(status, &[], xml)
}

/// `(PartNumber, ETag)` pairs in document order
fn parse_complete_body(xml: &str) -> Vec<(u32, String)> {
    let mut parts = Vec::new();
    for chunk in xml.split("<Part>").skip(1) {
        let number = between(chunk, "<PartNumber>", "</PartNumber>").parse().unwrap();
        let etag = between(chunk, "<ETag>", "</ETag>").replace("&quot;", "\"");
        parts.push((number, etag));
    }
    parts
}

fn between<'a>(s: &'a str, open: &str, close: &str) -> &'a str {
    let start = s.find(open).unwrap() + open.len();
    let end = s[start..].find(close).unwrap() + start;
    &s[start..end]
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
            out.push(u8::from_str_radix(hex, 16).unwrap());
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).unwrap()
}
