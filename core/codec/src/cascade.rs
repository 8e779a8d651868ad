//! Codec for hierarchical cascade answers.
//!
//! A cascade answer is the path of selected nodes from the top level
//! down, e.g. country, region, district.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::legacy::{join_display, split_tokens, structured_or};
use crate::ResponseCodec;

/// One selected level of a cascade answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CascadeAnswer {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CascadeAnswer {
    /// Create a level with name and optional code.
    pub fn new(name: impl Into<String>, code: Option<String>) -> Self {
        Self {
            name: name.into(),
            code: code.filter(|c| !c.is_empty()),
        }
    }
}

/// Codec for `CASCADE` responses.
pub struct CascadeValueCodec;

impl ResponseCodec for CascadeValueCodec {
    type Value = Vec<CascadeAnswer>;

    fn serialize(value: &Self::Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|e| {
            warn!("Failed to serialize cascade answer: {}", e);
            String::new()
        })
    }

    fn deserialize(raw: &str) -> Self::Value {
        if raw.trim().is_empty() {
            return Vec::new();
        }
        let levels: Vec<CascadeAnswer> = structured_or(raw, |raw| {
            split_tokens(raw)
                .into_iter()
                .map(|name| CascadeAnswer::new(name, None))
                .collect()
        });
        levels
            .into_iter()
            .map(|level| CascadeAnswer::new(level.name, level.code))
            .collect()
    }

    fn display_name(raw: &str) -> String {
        let levels = Self::deserialize(raw);
        join_display(levels.iter().map(|l| l.name.as_str()))
    }
}
