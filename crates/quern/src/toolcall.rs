//! Extraction of `<tool_call>` blocks from raw model output.
//!
//! Models trained for tool use emit calls inline as
//! `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` mixed with
//! ordinary prose. This module splits a completed generation into the
//! visible text and the structured calls it contains.

use serde::Deserialize;
use uuid::Uuid;

use crate::protocol::{FunctionCall, ToolCall};

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

#[derive(Deserialize)]
struct TaggedCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

fn call_id(index: usize) -> String {
    format!("call_{index}_{}", Uuid::new_v4().simple())
}

/// Split raw model output into visible text and extracted tool calls.
///
/// Scans left to right for matched marker pairs. Malformed JSON inside a
/// matched pair is logged and skipped; an opening marker with no closing
/// marker is not a tool call and stays in the visible text verbatim.
/// The visible text is whitespace-trimmed.
pub fn extract_tool_calls(raw: &str) -> (String, Vec<ToolCall>) {
    let mut visible = String::new();
    let mut calls = Vec::new();
    let mut rest = raw;

    while let Some((before, after_open)) = rest.split_once(TOOL_CALL_OPEN) {
        let Some((body, after_close)) = after_open.split_once(TOOL_CALL_CLOSE) else {
            // Unterminated marker: everything from it onward is plain text.
            visible.push_str(before);
            visible.push_str(TOOL_CALL_OPEN);
            visible.push_str(after_open);
            return (visible.trim().to_string(), calls);
        };

        visible.push_str(before);
        match serde_json::from_str::<TaggedCall>(body.trim()) {
            Ok(tagged) => {
                let arguments = match &tagged.arguments {
                    serde_json::Value::String(s) => s.clone(),
                    value => value.to_string(),
                };
                calls.push(ToolCall {
                    id: call_id(calls.len()),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: tagged.name,
                        arguments,
                    },
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, body = body.trim(), "skipping malformed tool call");
            }
        }
        rest = after_close;
    }

    visible.push_str(rest);
    (visible.trim().to_string(), calls)
}

/// Whether `text` ends with a prefix of the opening marker (including the
/// whole marker). Streaming uses this to hold back a tail that might turn
/// out to be the start of a tool call once more tokens arrive.
pub fn partial_open_suffix(text: &str) -> usize {
    let bytes = text.as_bytes();
    let marker = TOOL_CALL_OPEN.as_bytes();
    let longest = marker.len().min(bytes.len());
    for take in (1..=longest).rev() {
        if bytes[bytes.len() - take..] == marker[..take] {
            return take;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn plain_text_passes_through() {
        let (text, calls) = extract_tool_calls("Hello, world!");
        assert_eq!(text, "Hello, world!");
        assert!(calls.is_empty());
    }

    #[test]
    fn single_call_is_extracted() {
        let raw = r#"Sure. <tool_call>{"name": "foo", "arguments": {"a": 1}}</tool_call>"#;
        let (text, calls) = extract_tool_calls(raw);
        assert_eq!(text, "Sure.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, "function");
        assert_eq!(calls[0].function.name, "foo");
        let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args, serde_json::json!({"a": 1}));
    }

    #[test]
    fn multiple_calls_keep_order_and_surrounding_text() {
        let raw = concat!(
            "first ",
            r#"<tool_call>{"name": "a", "arguments": {}}</tool_call>"#,
            " middle ",
            r#"<tool_call>{"name": "b", "arguments": {"x": "y"}}</tool_call>"#,
            " last"
        );
        let (text, calls) = extract_tool_calls(raw);
        assert_eq!(text, "first  middle  last");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "a");
        assert_eq!(calls[1].function.name, "b");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn malformed_json_is_skipped() {
        let raw = r#"before <tool_call>{not json}</tool_call> after"#;
        let (text, calls) = extract_tool_calls(raw);
        assert_eq!(text, "before  after");
        assert!(calls.is_empty());
    }

    #[test]
    fn unterminated_marker_stays_visible() {
        let raw = r#"thinking <tool_call>{"name": "foo""#;
        let (text, calls) = extract_tool_calls(raw);
        assert_eq!(text, raw);
        assert!(calls.is_empty());
    }

    #[test]
    fn string_arguments_are_not_double_encoded() {
        let raw = r#"<tool_call>{"name": "foo", "arguments": "{\"a\": 1}"}</tool_call>"#;
        let (_, calls) = extract_tool_calls(raw);
        assert_eq!(calls[0].function.arguments, r#"{"a": 1}"#);
    }

    #[test]
    fn missing_arguments_default_to_null() {
        let raw = r#"<tool_call>{"name": "foo"}</tool_call>"#;
        let (_, calls) = extract_tool_calls(raw);
        assert_eq!(calls[0].function.arguments, "null");
    }

    #[test_case("hello <", 1; "single angle bracket")]
    #[test_case("hello <tool_c", 7; "partial marker")]
    #[test_case("hello <tool_call>", 11; "complete marker")]
    #[test_case("a < b", 0; "angle bracket followed by other text")]
    #[test_case("hello", 0; "no marker tail")]
    #[test_case("", 0; "empty input")]
    fn partial_open_suffix_detects_marker_prefixes(text: &str, expected: usize) {
        assert_eq!(partial_open_suffix(text), expected);
    }
}
