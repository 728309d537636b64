//! Core domain types for the granary document host.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Document identifiers, including composite fork/snapshot URL ids
//! - MD5 content checksums
//! - Storage manager and backend configuration

pub mod config;
pub mod docid;
pub mod error;
pub mod hash;

pub use config::{HostedOptions, StorageConfig};
pub use docid::{validate_doc_id, DocIdParts, NEW_DOCUMENT_CODE};
pub use error::{Error, Result};
pub use hash::{Checksum, ChecksumHasher};

/// Sentinel digest recorded in the worker directory for deleted documents.
pub const DELETED_SENTINEL: &str = "DELETED";
