//! s3xfer - S3 protocol client with SigV4 signing and multipart transfer coordination

pub mod cli;
pub mod config;
pub mod core;
pub mod s3;
pub mod transfer;

pub use core::Core;
pub use config::Config;
pub use s3::{S3Client, S3Error};
pub use transfer::{TransferConfig, TransferOutcome};
