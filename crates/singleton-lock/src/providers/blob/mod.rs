//! Blob-store lease backend.

mod client;

pub use client::{BlobLeaseConfig, BlobLeaseProvider};
