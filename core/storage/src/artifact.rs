//! Upload descriptors for export artifacts.
//!
//! The remote layout is derived from the file extension alone: captured
//! media is public under [`MEDIA_DIR`], form-data bundles are private
//! under [`DATA_DIR`].

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use fieldsync_common::Result;

use crate::hash::{md5_base64, md5_hex, FileHasher};

/// Remote directory for photos and videos.
pub const MEDIA_DIR: &str = "images";
/// Remote directory for form-data bundles.
pub const DATA_DIR: &str = "devicezip";

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Media,
    FormData,
}

impl ArtifactKind {
    /// Classify a filename by extension. Matching is case-insensitive.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "mp4" => Some(Self::Media),
            "zip" | "json" => Some(Self::FormData),
            _ => None,
        }
    }

    pub fn remote_dir(self) -> &'static str {
        match self {
            Self::Media => MEDIA_DIR,
            Self::FormData => DATA_DIR,
        }
    }

    pub fn is_public(self) -> bool {
        matches!(self, Self::Media)
    }
}

/// Content type sent for `filename`.
pub fn content_type(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Everything needed to upload one artifact from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Artifact {
    pub path: PathBuf,
    pub filename: String,
    pub kind: ArtifactKind,
    pub content_type: &'static str,
    pub md5: [u8; 16],
}

impl S3Artifact {
    /// Object key, `{dir}/{filename}`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.remote_dir(), self.filename)
    }

    pub fn is_public(&self) -> bool {
        self.kind.is_public()
    }

    pub fn md5_base64(&self) -> String {
        md5_base64(&self.md5)
    }

    pub fn md5_hex(&self) -> String {
        md5_hex(&self.md5)
    }
}

/// Resolves transmission filenames to artifacts on disk.
pub struct ArtifactMapper<H> {
    media_dir: PathBuf,
    data_dir: PathBuf,
    hasher: H,
}

impl<H: FileHasher> ArtifactMapper<H> {
    pub fn new(media_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>, hasher: H) -> Self {
        Self {
            media_dir: media_dir.into(),
            data_dir: data_dir.into(),
            hasher,
        }
    }

    /// Local directory holding artifacts of `kind`.
    pub fn local_dir(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Media => &self.media_dir,
            ArtifactKind::FormData => &self.data_dir,
        }
    }

    /// Describe the artifact for `filename`.
    ///
    /// Returns `Ok(None)` when the extension is not uploadable or the file
    /// does not exist. Such a transmission can never succeed.
    ///
    /// # Errors
    /// - `Error::Io` if the file exists but cannot be read
    pub fn describe(&self, filename: &str) -> Result<Option<S3Artifact>> {
        let Some(kind) = ArtifactKind::from_filename(filename) else {
            warn!("Unsupported artifact type: {}", filename);
            return Ok(None);
        };
        let Some(name) = Path::new(filename).file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };

        let path = self.local_dir(kind).join(name);
        if !path.is_file() {
            debug!("Artifact {} not found at {}", filename, path.display());
            return Ok(None);
        }

        let md5 = self.hasher.md5(&path)?;
        Ok(Some(S3Artifact {
            path,
            filename: name.to_string(),
            kind,
            content_type: content_type(name),
            md5,
        }))
    }
}
