//! Passthrough codecs for media references and plain text.

use std::path::Path;

use crate::ResponseCodec;

/// Codec for `IMAGE` and `VIDEO` responses. The value is the local file
/// path of the captured media.
pub struct MediaCodec;

impl MediaCodec {
    /// Final path component of a stored media reference.
    pub fn filename(raw: &str) -> Option<&str> {
        Path::new(raw).file_name().and_then(|name| name.to_str())
    }
}

impl ResponseCodec for MediaCodec {
    type Value = String;

    fn serialize(value: &Self::Value) -> String {
        value.clone()
    }

    fn deserialize(raw: &str) -> Self::Value {
        raw.to_string()
    }

    fn display_name(raw: &str) -> String {
        Self::filename(raw).unwrap_or(raw).to_string()
    }
}

/// Codec for free text, numbers, dates and every other untyped answer.
pub struct PlainTextCodec;

impl ResponseCodec for PlainTextCodec {
    type Value = String;

    fn serialize(value: &Self::Value) -> String {
        value.clone()
    }

    fn deserialize(raw: &str) -> Self::Value {
        raw.to_string()
    }

    fn display_name(raw: &str) -> String {
        raw.to_string()
    }
}
