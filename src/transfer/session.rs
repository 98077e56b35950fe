//! Multipart upload session state machine
//!
//! ```text
//! Initiated ──record_part──> InProgress ──mark_completed──> Completed
//!     │                          │
//!     └──────mark_aborted────────┴──────────────────────> Aborted
//! ```

use crate::s3::error::{Result, S3Error};
use crate::s3::types::CompletedPart;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    InProgress,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initiated => "initiated",
            SessionState::InProgress => "in-progress",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One server-side multipart upload and the parts acknowledged so far
#[derive(Debug, Clone)]
pub struct MultipartSession {
    bucket: String,
    key: String,
    upload_id: String,
    state: SessionState,
    parts: BTreeMap<u32, String>,
}

impl MultipartSession {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Record the ETag returned for `part_number`, exactly as received.
    pub fn record_part(&mut self, part_number: u32, etag: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.illegal("record a part"));
        }
        if part_number == 0 {
            return Err(S3Error::InvalidState("part numbers start at 1".to_string()));
        }
        if self.parts.contains_key(&part_number) {
            return Err(S3Error::InvalidState(format!(
                "part {} of upload {} recorded twice",
                part_number, self.upload_id
            )));
        }

        self.parts.insert(part_number, etag.into());
        self.state = SessionState::InProgress;
        Ok(())
    }

    /// Parts in ascending order, checked to be exactly `1..=expected`.
    pub fn completed_parts(&self, expected: usize) -> Result<Vec<CompletedPart>> {
        if self.state != SessionState::InProgress {
            return Err(self.illegal("list parts for completion"));
        }
        if self.parts.len() != expected {
            return Err(S3Error::InvalidState(format!(
                "upload {} has {} of {} parts",
                self.upload_id,
                self.parts.len(),
                expected
            )));
        }

        let parts: Vec<CompletedPart> = self
            .parts
            .iter()
            .map(|(&number, etag)| CompletedPart::new(number, etag.as_str()))
            .collect();

        if let Some((index, part)) = parts
            .iter()
            .enumerate()
            .find(|(i, part)| part.part_number as usize != i + 1)
        {
            return Err(S3Error::InvalidState(format!(
                "upload {} is missing part {} (found {})",
                self.upload_id,
                index + 1,
                part.part_number
            )));
        }
        Ok(parts)
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        if self.state != SessionState::InProgress {
            return Err(self.illegal("complete"));
        }
        self.state = SessionState::Completed;
        Ok(())
    }

    pub fn mark_aborted(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.illegal("abort"));
        }
        self.state = SessionState::Aborted;
        Ok(())
    }

    fn illegal(&self, action: &str) -> S3Error {
        S3Error::InvalidState(format!(
            "cannot {} upload {}: session is {}",
            action, self.upload_id, self.state
        ))
    }
}
