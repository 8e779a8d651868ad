//! File checksums and request timestamps.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use fieldsync_common::Result;

const READ_CHUNK: usize = 64 * 1024;

/// Computes content checksums of artifacts on disk.
pub trait FileHasher: Send + Sync {
    /// Raw MD5 digest of the file at `path`.
    fn md5(&self, path: &Path) -> Result<[u8; 16]>;
}

/// Streaming MD5 over the file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl FileHasher for Md5Hasher {
    fn md5(&self, path: &Path) -> Result<[u8; 16]> {
        let mut file = File::open(path)?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }
}

/// MD5 of an in-memory buffer.
pub fn md5_bytes(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Lowercase hex form, as returned in an S3 `ETag`.
pub fn md5_hex(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Base64 form, as sent in `Content-MD5`.
pub fn md5_base64(digest: &[u8; 16]) -> String {
    STANDARD.encode(digest)
}

/// Source of the current time for request dates.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time formatted for the `Date` header.
    fn http_date(&self) -> String {
        http_date(self.now())
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// RFC 1123 date, e.g. `Thu, 15 Oct 2026 10:00:00 GMT`.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
