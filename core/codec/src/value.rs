//! Tag-dispatched answer values.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cascade::{CascadeAnswer, CascadeValueCodec};
use crate::media::{MediaCodec, PlainTextCodec};
use crate::option::{OptionAnswer, OptionListCodec};
use crate::signature::{SignatureAnswer, SignatureCodec};
use crate::ResponseCodec;

/// Type tag stored next to every response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseType {
    Value,
    Option,
    Cascade,
    Signature,
    Image,
    Video,
    Geo,
    Date,
    MetaName,
    MetaGeo,
    /// A tag this version does not know. Kept verbatim.
    Other(String),
}

/// Codec family a type tag dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Option,
    Cascade,
    Signature,
    Media,
    PlainText,
}

impl ResponseType {
    /// Parse a stored tag. Unknown tags are preserved as [`ResponseType::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "VALUE" => Self::Value,
            "OPTION" => Self::Option,
            "CASCADE" => Self::Cascade,
            "SIGNATURE" => Self::Signature,
            "IMAGE" => Self::Image,
            "VIDEO" => Self::Video,
            "GEO" => Self::Geo,
            "DATE" => Self::Date,
            "META_NAME" => Self::MetaName,
            "META_GEO" => Self::MetaGeo,
            other => Self::Other(other.to_string()),
        }
    }

    /// The tag as stored.
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Value => "VALUE",
            Self::Option => "OPTION",
            Self::Cascade => "CASCADE",
            Self::Signature => "SIGNATURE",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Geo => "GEO",
            Self::Date => "DATE",
            Self::MetaName => "META_NAME",
            Self::MetaGeo => "META_GEO",
            Self::Other(tag) => tag,
        }
    }

    pub fn codec(&self) -> CodecKind {
        match self {
            Self::Option => CodecKind::Option,
            Self::Cascade => CodecKind::Cascade,
            Self::Signature => CodecKind::Signature,
            Self::Image | Self::Video => CodecKind::Media,
            _ => CodecKind::PlainText,
        }
    }

    /// Whether responses of this type reference a media file that must be
    /// uploaded alongside the form data.
    pub fn is_media(&self) -> bool {
        self.codec() == CodecKind::Media
    }
}

impl From<String> for ResponseType {
    fn from(tag: String) -> Self {
        Self::from_tag(&tag)
    }
}

impl From<ResponseType> for String {
    fn from(value: ResponseType) -> Self {
        value.as_tag().to_string()
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A decoded answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerValue {
    Options(Vec<OptionAnswer>),
    Cascade(Vec<CascadeAnswer>),
    Signature(SignatureAnswer),
    Media(String),
    Text(String),
}

impl AnswerValue {
    /// Decode a stored value according to its type tag. Never fails.
    pub fn decode(response_type: &ResponseType, raw: &str) -> Self {
        match response_type.codec() {
            CodecKind::Option => Self::Options(OptionListCodec::deserialize(raw)),
            CodecKind::Cascade => Self::Cascade(CascadeValueCodec::deserialize(raw)),
            CodecKind::Signature => Self::Signature(SignatureCodec::deserialize(raw)),
            CodecKind::Media => Self::Media(MediaCodec::deserialize(raw)),
            CodecKind::PlainText => Self::Text(PlainTextCodec::deserialize(raw)),
        }
    }

    /// Encode into the stored representation.
    pub fn encode(&self) -> String {
        match self {
            Self::Options(options) => OptionListCodec::serialize(options),
            Self::Cascade(levels) => CascadeValueCodec::serialize(levels),
            Self::Signature(signature) => SignatureCodec::serialize(signature),
            Self::Media(path) => MediaCodec::serialize(path),
            Self::Text(text) => PlainTextCodec::serialize(text),
        }
    }

    /// Human readable form, used e.g. for data point names.
    pub fn display_name(&self) -> String {
        display_name(&self.default_type(), &self.encode())
    }

    fn default_type(&self) -> ResponseType {
        match self {
            Self::Options(_) => ResponseType::Option,
            Self::Cascade(_) => ResponseType::Cascade,
            Self::Signature(_) => ResponseType::Signature,
            Self::Media(_) => ResponseType::Image,
            Self::Text(_) => ResponseType::Value,
        }
    }
}

/// Display name of a stored value, dispatched on its type tag.
pub fn display_name(response_type: &ResponseType, raw: &str) -> String {
    match response_type.codec() {
        CodecKind::Option => OptionListCodec::display_name(raw),
        CodecKind::Cascade => CascadeValueCodec::display_name(raw),
        CodecKind::Signature => SignatureCodec::display_name(raw),
        CodecKind::Media => MediaCodec::display_name(raw),
        CodecKind::PlainText => PlainTextCodec::display_name(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for tag in ["VALUE", "OPTION", "CASCADE", "SIGNATURE", "IMAGE", "GEO", "CADDISFLY"] {
            assert_eq!(ResponseType::from_tag(tag).as_tag(), tag);
        }
        assert_eq!(
            ResponseType::from_tag("CADDISFLY"),
            ResponseType::Other("CADDISFLY".to_string())
        );
    }

    #[test]
    fn test_dispatch_on_tag() {
        let decoded = AnswerValue::decode(&ResponseType::Option, "A|B");
        assert_eq!(
            decoded,
            AnswerValue::Options(vec![OptionAnswer::new("A"), OptionAnswer::new("B")])
        );

        let decoded = AnswerValue::decode(&ResponseType::Value, "A|B");
        assert_eq!(decoded, AnswerValue::Text("A|B".to_string()));

        let decoded = AnswerValue::decode(&ResponseType::Video, "/m/clip.mp4");
        assert_eq!(decoded, AnswerValue::Media("/m/clip.mp4".to_string()));
    }

    #[test]
    fn test_encode_never_produces_pipes_for_lists() {
        let value = AnswerValue::decode(&ResponseType::Cascade, "Kenya|Nairobi");
        let encoded = value.encode();
        assert!(encoded.starts_with('['));
        assert_eq!(value.display_name(), "Kenya - Nairobi");
    }

    #[test]
    fn test_media_types() {
        assert!(ResponseType::Image.is_media());
        assert!(ResponseType::Video.is_media());
        assert!(!ResponseType::Signature.is_media());
    }

    #[test]
    fn test_serde_as_tag() {
        let json = serde_json::to_string(&ResponseType::Cascade).unwrap();
        assert_eq!(json, "\"CASCADE\"");
        let parsed: ResponseType = serde_json::from_str("\"GEOSHAPE\"").unwrap();
        assert_eq!(parsed, ResponseType::Other("GEOSHAPE".to_string()));
    }
}
