//! Non-streaming response assembly.

use chrono::Utc;

use crate::backend::RawCompletion;
use crate::protocol::{
    ChatCompletionResponse, Choice, Message, Role, Usage, completion_id,
};
use crate::toolcall::extract_tool_calls;

/// Build a complete chat response from one finished generation.
///
/// Tool-call markers are always scanned for. When no valid call is found the
/// generated text is returned exactly as the backend produced it.
pub fn assemble_response(model: &str, raw: RawCompletion) -> ChatCompletionResponse {
    let (visible, calls) = extract_tool_calls(&raw.text);
    let (message, finish_reason) = if calls.is_empty() {
        (Message::assistant(raw.text), raw.finish_reason)
    } else {
        let message = Message {
            role: Role::Assistant,
            content: if visible.is_empty() {
                None
            } else {
                Some(visible)
            },
            name: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        };
        (message, Some("tool_calls".to_string()))
    };

    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: finish_reason.or_else(|| Some("stop".to_string())),
        }],
        usage: raw.usage.unwrap_or_else(|| Usage::new(0, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawCompletion {
        RawCompletion {
            text: text.to_string(),
            finish_reason: Some("stop".to_string()),
            usage: Some(Usage::new(12, 7)),
        }
    }

    #[test]
    fn plain_completion_keeps_text_and_usage() {
        let response = assemble_response("m", raw("hello"));
        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("hello"));
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 19);
        assert!(response.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn tool_call_sets_finish_reason_and_clears_empty_content() {
        let text = r#"<tool_call>{"name": "get_time", "arguments": {"tz": "UTC"}}</tool_call>"#;
        let response = assemble_response("m", raw(text));
        let choice = &response.choices[0];
        assert!(choice.message.content.is_none());
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_time");
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn malformed_call_body_leaves_text_untouched() {
        let text = "before <tool_call>{not json}</tool_call> after";
        let response = assemble_response("m", raw(text));
        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some(text));
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn surrounding_whitespace_survives_when_no_call_is_found() {
        let response = assemble_response("m", raw("  hello  "));
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("  hello  ")
        );
    }
}
