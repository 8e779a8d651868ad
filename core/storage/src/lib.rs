//! Remote object storage for fieldsync export artifacts.
//!
//! This crate turns transmission filenames into signed uploads:
//! [`ArtifactMapper`] resolves a file on disk to an [`S3Artifact`] (remote
//! key, visibility, content type, MD5), [`RequestSigner`] produces the
//! `Authorization` header, and an [`ObjectStore`] performs the transfer.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the sync crate
//! - Async operations: all network I/O is async
//! - Unified error semantics: unreachable endpoints are `Connectivity`,
//!   everything else is scoped to one artifact

pub mod artifact;
pub mod auth;
pub mod hash;
pub mod memory;
pub mod provider;
pub mod s3;

pub use artifact::{content_type, ArtifactKind, ArtifactMapper, S3Artifact, DATA_DIR, MEDIA_DIR};
pub use auth::{CanonicalRequest, CanonicalRequestBuilder, Method, RequestSigner};
pub use hash::{http_date, md5_base64, md5_bytes, md5_hex, Clock, FileHasher, FixedClock, Md5Hasher, SystemClock};
pub use memory::{Failure, MemoryObjectStore};
pub use provider::{normalize_etag, ObjectStore, PutReceipt};
pub use s3::{S3Client, S3Config};
