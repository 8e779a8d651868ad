//! Object store trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use fieldsync_common::{Error, Result};

use crate::artifact::S3Artifact;

/// Acknowledgement of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReceipt {
    /// Object key written.
    pub key: String,
    /// Server-side content hash, quotes stripped. Empty if absent.
    pub etag: String,
}

impl PutReceipt {
    /// Check the server hash against the local MD5.
    ///
    /// # Errors
    /// - `Error::ChecksumMismatch` if the ETag is missing or differs
    pub fn verify(&self, expected_md5_hex: &str) -> Result<()> {
        if self.etag.is_empty() || !self.etag.eq_ignore_ascii_case(expected_md5_hex) {
            return Err(Error::ChecksumMismatch {
                expected: expected_md5_hex.to_string(),
                actual: self.etag.clone(),
            });
        }
        Ok(())
    }
}

/// Strip the quotes an S3 `ETag` header carries.
pub fn normalize_etag(raw: &str) -> String {
    raw.replace('"', "").trim().to_string()
}

/// Remote object store receiving export artifacts.
///
/// Implementations map transport failures onto the shared error taxonomy:
/// unreachable endpoints are `Error::Connectivity` (ends the sync cycle),
/// everything else affects only the artifact at hand.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store name for logs (e.g. "s3", "memory").
    fn name(&self) -> &str;

    /// Upload an artifact's content.
    ///
    /// # Preconditions
    /// - `data` is the complete file content whose MD5 is `artifact.md5`
    ///
    /// # Errors
    /// - `Error::Connectivity` if the endpoint cannot be reached
    /// - `Error::NotFound`, `Error::Auth`, `Error::Network` on rejection
    async fn put(&self, artifact: &S3Artifact, data: Bytes) -> Result<PutReceipt>;

    /// Download an object.
    async fn get(&self, key: &str) -> Result<Bytes>;
}
