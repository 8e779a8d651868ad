//! Codec for single and multiple choice answers.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::legacy::{join_display, split_tokens, structured_or};
use crate::ResponseCodec;

/// One selected option.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OptionAnswer {
    /// Option label as shown to the enumerator.
    #[serde(default)]
    pub text: String,
    /// Stable option code, if the form defines one.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub code: Option<String>,
    /// Whether this is the free-text "other" option.
    #[serde(rename = "isOther", default, skip_serializing_if = "is_false")]
    pub is_other: bool,
}

impl OptionAnswer {
    /// Create an option with a label only.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            code: None,
            is_other: false,
        }
    }

    /// Set the option code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Mark as the "other" option.
    pub fn other(mut self) -> Self {
        self.is_other = true;
        self
    }

    fn normalized(mut self) -> Self {
        if is_blank(&self.code) {
            self.code = None;
        }
        self
    }
}

fn is_blank(code: &Option<String>) -> bool {
    code.as_deref().map_or(true, str::is_empty)
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Codec for `OPTION` responses.
pub struct OptionListCodec;

impl ResponseCodec for OptionListCodec {
    type Value = Vec<OptionAnswer>;

    fn serialize(value: &Self::Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|e| {
            warn!("Failed to serialize option answer: {}", e);
            String::new()
        })
    }

    fn deserialize(raw: &str) -> Self::Value {
        if raw.trim().is_empty() {
            return Vec::new();
        }
        let options: Vec<OptionAnswer> = structured_or(raw, |raw| {
            split_tokens(raw).into_iter().map(OptionAnswer::new).collect()
        });
        options.into_iter().map(OptionAnswer::normalized).collect()
    }

    fn display_name(raw: &str) -> String {
        let options = Self::deserialize(raw);
        join_display(options.iter().map(|o| o.text.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_serialize_shape() {
        let value = vec![
            OptionAnswer::new("Yes").with_code("Y"),
            OptionAnswer::new("Something else").other(),
        ];
        assert_eq!(
            OptionListCodec::serialize(&value),
            r#"[{"text":"Yes","code":"Y"},{"text":"Something else","isOther":true}]"#
        );
    }

    #[test]
    fn test_legacy_pipe_fallback() {
        let options = OptionListCodec::deserialize("A|B|C");
        assert_eq!(options.len(), 3);
        for (option, expected) in options.iter().zip(["A", "B", "C"]) {
            assert_eq!(option.text, expected);
            assert!(option.code.is_none());
            assert!(!option.is_other);
        }
    }

    #[test]
    fn test_legacy_single_value() {
        let options = OptionListCodec::deserialize("42");
        assert_eq!(options, vec![OptionAnswer::new("42")]);
    }

    #[test]
    fn test_empty_input() {
        assert!(OptionListCodec::deserialize("").is_empty());
        assert!(OptionListCodec::deserialize("  ").is_empty());
    }

    #[test]
    fn test_empty_code_is_absent() {
        let options = OptionListCodec::deserialize(r#"[{"text":"A","code":""}]"#);
        assert_eq!(options[0].code, None);
    }

    #[test]
    fn test_display_name() {
        let raw = OptionListCodec::serialize(&vec![
            OptionAnswer::new("Red"),
            OptionAnswer::new("Blue"),
        ]);
        assert_eq!(OptionListCodec::display_name(&raw), "Red - Blue");
        assert_eq!(OptionListCodec::display_name("Red|Blue"), "Red - Blue");
    }

    fn option_strategy() -> impl Strategy<Value = OptionAnswer> {
        (".*", proptest::option::of(".+"), any::<bool>()).prop_map(|(text, code, is_other)| {
            OptionAnswer {
                text,
                code,
                is_other,
            }
        })
    }

    proptest! {
        #[test]
        fn test_round_trip(options in proptest::collection::vec(option_strategy(), 1..8)) {
            let encoded = OptionListCodec::serialize(&options);
            prop_assert_eq!(OptionListCodec::deserialize(&encoded), options);
        }
    }
}
