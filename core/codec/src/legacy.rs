//! Decoding helpers shared by the list-shaped codecs.
//!
//! Older app versions stored multi-value answers as plain text joined
//! with `|`. Readers still accept that form; writers never produce it.

use serde::de::DeserializeOwned;
use tracing::debug;

/// Separator used by the plain-text answer format.
pub const LEGACY_SEPARATOR: char = '|';

/// Split a plain-text answer into its tokens.
///
/// Empty tokens are kept, so `"A||B"` yields three tokens.
pub fn split_tokens(raw: &str) -> Vec<&str> {
    raw.split(LEGACY_SEPARATOR).collect()
}

/// Attempt a structured JSON decode and fall back to `fallback` on any
/// parse error.
///
/// The parse error is logged and never returned. A document that is
/// valid JSON but not of shape `T` counts as a parse error.
pub fn structured_or<T, F>(raw: &str, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce(&str) -> T,
{
    match serde_json::from_str::<T>(raw) {
        Ok(value) => value,
        Err(e) => {
            debug!("Falling back to plain-text decode: {}", e);
            fallback(raw)
        }
    }
}

/// Join display texts with the separator used for data point names.
pub fn join_display<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().collect::<Vec<_>>().join(" - ")
}
