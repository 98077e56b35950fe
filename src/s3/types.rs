//! S3 types and response structures

use crate::s3::error::{Result, S3Error};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as FmtWrite;

/// Element boundary reported by [`for_each_element`]
pub(crate) enum Tag<'a> {
    Open(&'a [u8]),
    Close(&'a [u8]),
}

/// Walk an XML document, reporting each element open/close by local name.
///
/// The text content of the element being closed is passed alongside the
/// `Close` tag; callbacks may `std::mem::take` it. The buffer is cleared after
/// every close.
pub(crate) fn for_each_element<F>(xml: &[u8], mut on_tag: F) -> std::result::Result<(), String>
where
    F: FnMut(Tag<'_>, &mut String),
{
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut current_text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current_text.clear();
                on_tag(Tag::Open(e.local_name().as_ref()), &mut current_text);
            }
            Ok(Event::Empty(e)) => {
                current_text.clear();
                on_tag(Tag::Open(e.local_name().as_ref()), &mut current_text);
                on_tag(Tag::Close(e.local_name().as_ref()), &mut current_text);
                current_text.clear();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| format!("XML parse error: {}", e))?;
                current_text.push_str(&text);
            }
            Ok(Event::CData(e)) => {
                current_text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(e)) => {
                on_tag(Tag::Close(e.local_name().as_ref()), &mut current_text);
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {}", e)),
            _ => {}
        }
    }

    Ok(())
}

fn parse_xml<F>(xml: &[u8], on_tag: F) -> Result<()>
where
    F: FnMut(Tag<'_>, &mut String),
{
    for_each_element(xml, on_tag).map_err(S3Error::decode)
}

fn parse_number<T: std::str::FromStr>(field: &str, text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| S3Error::decode(format!("invalid {field}: {text:?}")))
}

/// Object metadata returned by HEAD / GET
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
}

/// Result of a PUT (object or streamed object)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

// =============================================================================
// Multipart Upload Types
// =============================================================================

/// `InitiateMultipartUploadResult`, returned by CreateMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    /// Upload ID for subsequent UploadPart and CompleteMultipartUpload requests
    pub upload_id: String,
}

impl InitiateMultipartUploadResult {
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut bucket = String::new();
        let mut key = String::new();
        let mut upload_id = String::new();

        parse_xml(xml, |tag, text| match tag {
            Tag::Close(b"Bucket") => bucket = std::mem::take(text),
            Tag::Close(b"Key") => key = std::mem::take(text),
            Tag::Close(b"UploadId") => upload_id = std::mem::take(text),
            _ => {}
        })?;

        if upload_id.is_empty() {
            return Err(S3Error::decode("Missing UploadId in response"));
        }

        Ok(Self {
            bucket,
            key,
            upload_id,
        })
    }
}

/// Part information for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag exactly as returned from UploadPart
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// Build the `CompleteMultipartUpload` request body. Parts are written in the
/// order given.
pub fn complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut xml = String::with_capacity(parts.len() * 100 + 100);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>");
        xml_escape_into(&mut xml, &part.etag);
        xml.push_str("</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Escape XML special characters into an existing buffer
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

/// `CompleteMultipartUploadResult`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartUploadResult {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub version_id: Option<String>,
}

impl CompleteMultipartUploadResult {
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut result = Self::default();
        let mut saw_root = false;

        parse_xml(xml, |tag, text| match tag {
            Tag::Open(b"CompleteMultipartUploadResult") => saw_root = true,
            Tag::Close(b"Location") => result.location = Some(std::mem::take(text)),
            Tag::Close(b"Bucket") => result.bucket = std::mem::take(text),
            Tag::Close(b"Key") => result.key = std::mem::take(text),
            Tag::Close(b"ETag") => result.etag = std::mem::take(text),
            _ => {}
        })?;

        if !saw_root {
            return Err(S3Error::decode(
                "missing CompleteMultipartUploadResult element",
            ));
        }
        Ok(result)
    }
}

/// A part listed by ListParts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

/// `ListPartsResult`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPartsResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number_marker: Option<u32>,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: Option<u32>,
    pub is_truncated: bool,
    pub parts: Vec<Part>,
}

impl ListPartsResult {
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut result = Self::default();
        let mut current: Option<Part> = None;
        // Initiator/Owner also carry child elements; only top-level fields matter
        let mut depth_in_owner = 0usize;
        let mut failure: Option<S3Error> = None;

        parse_xml(xml, |tag, text| match tag {
            Tag::Open(b"Part") => current = Some(Part::default()),
            Tag::Open(b"Initiator" | b"Owner") => depth_in_owner += 1,
            Tag::Close(b"Initiator" | b"Owner") => {
                depth_in_owner = depth_in_owner.saturating_sub(1)
            }
            Tag::Close(b"Part") => {
                if let Some(part) = current.take() {
                    result.parts.push(part);
                }
            }
            Tag::Close(name) if depth_in_owner == 0 => match (current.as_mut(), name) {
                (Some(part), b"PartNumber") => match parse_number("PartNumber", text) {
                    Ok(n) => part.part_number = n,
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                },
                (Some(part), b"Size") => match parse_number("Size", text) {
                    Ok(n) => part.size = n,
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                },
                (Some(part), b"ETag") => part.etag = std::mem::take(text),
                (Some(part), b"LastModified") => part.last_modified = Some(std::mem::take(text)),
                (None, b"Bucket") => result.bucket = std::mem::take(text),
                (None, b"Key") => result.key = std::mem::take(text),
                (None, b"UploadId") => result.upload_id = std::mem::take(text),
                (None, b"PartNumberMarker") => result.part_number_marker = text.trim().parse().ok(),
                (None, b"NextPartNumberMarker") => {
                    result.next_part_number_marker = text.trim().parse().ok()
                }
                (None, b"MaxParts") => result.max_parts = text.trim().parse().ok(),
                (None, b"IsTruncated") => result.is_truncated = text.trim() == "true",
                _ => {}
            },
            _ => {}
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
}

/// An in-progress multipart upload listed by ListMultipartUploads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
    /// RFC 3339 initiation time as reported by the server
    pub initiated: Option<String>,
    pub storage_class: Option<String>,
}

/// `ListMultipartUploadsResult`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMultipartUploadsResult {
    pub bucket: String,
    pub prefix: Option<String>,
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
    pub max_uploads: Option<u32>,
    pub is_truncated: bool,
    pub uploads: Vec<MultipartUpload>,
    pub common_prefixes: Vec<String>,
}

impl ListMultipartUploadsResult {
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut result = Self::default();
        let mut current: Option<MultipartUpload> = None;
        let mut depth_in_owner = 0usize;
        let mut in_common_prefixes = false;

        parse_xml(xml, |tag, text| match tag {
            Tag::Open(b"Upload") => current = Some(MultipartUpload::default()),
            Tag::Open(b"Initiator" | b"Owner") => depth_in_owner += 1,
            Tag::Open(b"CommonPrefixes") => in_common_prefixes = true,
            Tag::Close(b"Initiator" | b"Owner") => {
                depth_in_owner = depth_in_owner.saturating_sub(1)
            }
            Tag::Close(b"CommonPrefixes") => in_common_prefixes = false,
            Tag::Close(b"Upload") => {
                if let Some(upload) = current.take() {
                    result.uploads.push(upload);
                }
            }
            Tag::Close(name) if depth_in_owner == 0 => match (current.as_mut(), name) {
                (Some(upload), b"Key") => upload.key = std::mem::take(text),
                (Some(upload), b"UploadId") => upload.upload_id = std::mem::take(text),
                (Some(upload), b"Initiated") => upload.initiated = Some(std::mem::take(text)),
                (Some(upload), b"StorageClass") => {
                    upload.storage_class = Some(std::mem::take(text))
                }
                (None, b"Prefix") if in_common_prefixes => {
                    result.common_prefixes.push(std::mem::take(text))
                }
                (None, b"Bucket") => result.bucket = std::mem::take(text),
                (None, b"Prefix") => result.prefix = non_empty(std::mem::take(text)),
                (None, b"KeyMarker") => result.key_marker = non_empty(std::mem::take(text)),
                (None, b"UploadIdMarker") => {
                    result.upload_id_marker = non_empty(std::mem::take(text))
                }
                (None, b"NextKeyMarker") => {
                    result.next_key_marker = non_empty(std::mem::take(text))
                }
                (None, b"NextUploadIdMarker") => {
                    result.next_upload_id_marker = non_empty(std::mem::take(text))
                }
                (None, b"MaxUploads") => result.max_uploads = text.trim().parse().ok(),
                (None, b"IsTruncated") => result.is_truncated = text.trim() == "true",
                _ => {}
            },
            _ => {}
        })?;

        Ok(result)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
