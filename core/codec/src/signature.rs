//! Codec for signature answers.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::legacy::structured_or;
use crate::ResponseCodec;

/// A captured signature: signer name plus base64 PNG image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64-encoded image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl SignatureAnswer {
    /// Build a signature from a name and raw image bytes.
    pub fn from_image_bytes(name: impl Into<String>, image: &[u8]) -> Self {
        Self {
            name: Some(name.into()),
            image: Some(STANDARD.encode(image)),
        }
    }

    /// A signature is valid when name and image are both present or both
    /// absent. Empty strings count as absent.
    pub fn is_valid(&self) -> bool {
        present(&self.name) == present(&self.image)
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        !present(&self.name) && !present(&self.image)
    }

    /// Decode the image bytes. Returns `None` if absent or not valid base64.
    pub fn image_bytes(&self) -> Option<Vec<u8>> {
        let image = self.image.as_deref().filter(|s| !s.is_empty())?;
        match STANDARD.decode(image) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Signature image is not valid base64: {}", e);
                None
            }
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |s| !s.is_empty())
}

/// Codec for `SIGNATURE` responses.
pub struct SignatureCodec;

impl ResponseCodec for SignatureCodec {
    type Value = SignatureAnswer;

    fn serialize(value: &Self::Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|e| {
            warn!("Failed to serialize signature: {}", e);
            String::new()
        })
    }

    fn deserialize(raw: &str) -> Self::Value {
        if raw.trim().is_empty() {
            return SignatureAnswer::default();
        }
        structured_or(raw, |_| {
            debug!("Discarding malformed signature value");
            SignatureAnswer::default()
        })
    }

    fn display_name(raw: &str) -> String {
        Self::deserialize(raw).name.unwrap_or_default()
    }
}
