//! Range splitting for multipart transfers

use crate::s3::error::{Result, S3Error};

/// S3 rejects part numbers above this
pub const MAX_PARTS: u64 = 10_000;

/// One contiguous slice of the object, `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPart {
    /// 1-based
    pub part_number: u32,
    pub start: u64,
    /// Inclusive
    pub end: u64,
}

impl TransferPart {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Split `total` bytes into parts of `part_size` (the last part may be short).
///
/// Zero bytes yield no parts. A zero part size, or a split needing more than
/// [`MAX_PARTS`] parts, is a configuration error.
pub fn plan_parts(total: u64, part_size: u64) -> Result<Vec<TransferPart>> {
    if part_size == 0 {
        return Err(S3Error::InvalidConfig("part size must be greater than zero".to_string()));
    }

    let count = total.div_ceil(part_size);
    if count > MAX_PARTS {
        return Err(S3Error::InvalidConfig(format!(
            "{} bytes at part size {} needs {} parts, more than the {} allowed",
            total, part_size, count, MAX_PARTS
        )));
    }

    Ok((0..count)
        .map(|i| {
            let start = i * part_size;
            TransferPart {
                part_number: (i + 1) as u32,
                start,
                end: (start + part_size - 1).min(total - 1),
            }
        })
        .collect())
}
