//! Response value codecs for fieldsync.
//!
//! Every answer is stored as text next to a type tag. This crate turns
//! structured answers into that text and back:
//! - Option and cascade answers are JSON arrays
//! - Signatures are a JSON object with a base64 image
//! - Media and plain text answers are stored as-is
//!
//! Decoding never fails. Values written by older app versions as
//! `|`-separated text are read through a plain-text fallback, and
//! anything else that cannot be parsed decodes to an empty default.

pub mod cascade;
pub mod legacy;
pub mod media;
pub mod option;
pub mod signature;
pub mod value;

pub use cascade::{CascadeAnswer, CascadeValueCodec};
pub use media::{MediaCodec, PlainTextCodec};
pub use option::{OptionAnswer, OptionListCodec};
pub use signature::{SignatureAnswer, SignatureCodec};
pub use value::{display_name, AnswerValue, CodecKind, ResponseType};

/// Encode/decode pair for one answer type.
pub trait ResponseCodec {
    /// Structured answer type.
    type Value;

    /// Encode into the stored representation.
    fn serialize(value: &Self::Value) -> String;

    /// Decode a stored value. Malformed input degrades to the legacy
    /// fallback or an empty default; it is logged, never returned.
    fn deserialize(raw: &str) -> Self::Value;

    /// Human readable summary of a stored value.
    fn display_name(raw: &str) -> String;
}
