//! Incremental stream assembly.
//!
//! Backend deltas arrive with no respect for marker boundaries: a
//! `<tool_call>` tag can be split across any number of fragments. The
//! assembler is a small state machine that forwards plain text as content
//! chunks while holding back any tail that could still turn into the
//! opening marker, buffers marker bodies until they close, and then
//! replays the call as the OpenAI incremental tool-call chunk sequence.

use crate::protocol::{
    ChatCompletionChunk, ChunkDelta, FunctionDelta, ToolCallDelta, Usage, completion_id,
};
use crate::toolcall::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN, partial_open_suffix};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

enum State {
    /// Forwarding content; `buffer` holds a possible marker prefix.
    Passthrough,
    /// Inside an open marker; `buffer` holds the body seen so far.
    BufferingTag,
    /// A tool call was emitted; the stream is logically over.
    Done,
}

/// Reassembles one streaming generation into SSE frames.
///
/// Feed raw fragments through [`process`](Self::process), then exactly one
/// of [`finish`](Self::finish) or [`error`](Self::error). Every returned
/// string is a complete `data: ...\n\n` frame ready for the wire.
pub struct StreamingAssembler {
    id: String,
    model: String,
    state: State,
    buffer: String,
    sent_role: bool,
}

impl StreamingAssembler {
    pub fn new(model: &str) -> Self {
        Self {
            id: completion_id(),
            model: model.to_string(),
            state: State::Passthrough,
            buffer: String::new(),
            sent_role: false,
        }
    }

    fn frame(&self, chunk: &ChatCompletionChunk) -> Option<String> {
        match serde_json::to_string(chunk) {
            Ok(json) => Some(format!("data: {json}\n\n")),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize stream chunk");
                None
            }
        }
    }

    fn delta(&mut self) -> ChunkDelta {
        let role = if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some("assistant".to_string())
        };
        ChunkDelta {
            role,
            ..ChunkDelta::default()
        }
    }

    fn content_frame(&mut self, text: &str, out: &mut Vec<String>) {
        if text.is_empty() {
            return;
        }
        let mut delta = self.delta();
        delta.content = Some(text.to_string());
        let chunk = ChatCompletionChunk::new(&self.id, &self.model, delta, None);
        out.extend(self.frame(&chunk));
    }

    /// Emit one complete tool call as the three-step incremental sequence
    /// OpenAI clients expect: name first, then the argument string in two
    /// slices, with the last chunk carrying the terminal finish reason.
    fn tool_call_frames(&mut self, name: &str, arguments: &str, out: &mut Vec<String>) {
        let id = format!("call_0_{}", uuid::Uuid::new_v4().simple());

        let mut head = self.delta();
        head.tool_calls = Some(vec![ToolCallDelta {
            index: 0,
            id: Some(id),
            kind: Some("function".to_string()),
            function: Some(FunctionDelta {
                name: Some(name.to_string()),
                arguments: Some(String::new()),
            }),
        }]);
        let chunk = ChatCompletionChunk::new(&self.id, &self.model, head, None);
        out.extend(self.frame(&chunk));

        let mut mid = arguments.len() / 2;
        while !arguments.is_char_boundary(mid) {
            mid -= 1;
        }
        let (first, second) = arguments.split_at(mid);

        if !first.is_empty() {
            let delta = ChunkDelta {
                tool_calls: Some(vec![argument_slice(first)]),
                ..ChunkDelta::default()
            };
            let chunk = ChatCompletionChunk::new(&self.id, &self.model, delta, None);
            out.extend(self.frame(&chunk));
        }

        let delta = ChunkDelta {
            tool_calls: Some(vec![argument_slice(second)]),
            ..ChunkDelta::default()
        };
        let mut chunk = ChatCompletionChunk::new(
            &self.id,
            &self.model,
            delta,
            Some("tool_calls".to_string()),
        );
        chunk.usage = Some(Usage::new(0, 0));
        out.extend(self.frame(&chunk));
    }

    /// Feed one raw fragment; returns zero or more SSE frames.
    pub fn process(&mut self, piece: &str) -> Vec<String> {
        let mut out = Vec::new();
        if piece.is_empty() {
            return out;
        }

        self.buffer.push_str(piece);
        loop {
            match self.state {
                State::Passthrough => {
                    if let Some((before, after)) = self.buffer.split_once(TOOL_CALL_OPEN) {
                        let before = before.to_string();
                        self.buffer = after.to_string();
                        self.content_frame(&before, &mut out);
                        self.state = State::BufferingTag;
                        continue;
                    }
                    // Hold back any tail that might still become the
                    // opening marker once the next fragment arrives.
                    let keep = partial_open_suffix(&self.buffer);
                    let emit_to = self.buffer.len() - keep;
                    let (emit, tail) = self.buffer.split_at(emit_to);
                    let emit = emit.to_string();
                    self.buffer = tail.to_string();
                    self.content_frame(&emit, &mut out);
                    return out;
                }
                State::BufferingTag => {
                    let Some((body, after)) = self.buffer.split_once(TOOL_CALL_CLOSE) else {
                        return out;
                    };
                    let body = body.trim().to_string();
                    self.buffer = after.to_string();
                    match serde_json::from_str::<serde_json::Value>(&body) {
                        Ok(value) if value.get("name").and_then(|n| n.as_str()).is_some() => {
                            let name = value["name"].as_str().unwrap_or_default().to_string();
                            let arguments = match value.get("arguments") {
                                Some(serde_json::Value::String(s)) => s.clone(),
                                Some(other) => other.to_string(),
                                None => "null".to_string(),
                            };
                            self.tool_call_frames(&name, &arguments, &mut out);
                            self.state = State::Done;
                            return out;
                        }
                        Ok(_) | Err(_) => {
                            tracing::warn!(body = %body, "skipping malformed tool call in stream");
                            self.state = State::Passthrough;
                            continue;
                        }
                    }
                }
                State::Done => {
                    self.buffer.clear();
                    return out;
                }
            }
        }
    }

    /// End of generation: flush held-back text and close the stream.
    pub fn finish(&mut self, usage: Option<Usage>) -> Vec<String> {
        let mut out = Vec::new();
        match self.state {
            State::Passthrough => {
                // The tail never became a marker, so it was real content.
                let held = std::mem::take(&mut self.buffer);
                self.content_frame(&held, &mut out);
                let delta = self.delta();
                let mut chunk = ChatCompletionChunk::new(
                    &self.id,
                    &self.model,
                    delta,
                    Some("stop".to_string()),
                );
                chunk.usage = usage;
                out.extend(self.frame(&chunk));
            }
            State::BufferingTag => {
                tracing::debug!(
                    discarded = self.buffer.len(),
                    "stream ended inside an unterminated tool call"
                );
                self.buffer.clear();
                let delta = self.delta();
                let mut chunk = ChatCompletionChunk::new(
                    &self.id,
                    &self.model,
                    delta,
                    Some("stop".to_string()),
                );
                chunk.usage = usage;
                out.extend(self.frame(&chunk));
            }
            State::Done => {}
        }
        out.push(DONE_FRAME.to_string());
        out
    }

    /// Generation failed mid-stream. The HTTP status is long gone, so the
    /// failure is reported in-band before the stream closes.
    pub fn error(&mut self, message: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.buffer.clear();
        self.state = State::Done;
        let mut delta = self.delta();
        delta.content = Some(format!("Error: {message}"));
        let chunk =
            ChatCompletionChunk::new(&self.id, &self.model, delta, Some("error".to_string()));
        out.extend(self.frame(&chunk));
        out.push(DONE_FRAME.to_string());
        out
    }
}

fn argument_slice(arguments: &str) -> ToolCallDelta {
    ToolCallDelta {
        index: 0,
        id: None,
        kind: None,
        function: Some(FunctionDelta {
            name: None,
            arguments: Some(arguments.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &str) -> ChatCompletionChunk {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(json).unwrap()
    }

    fn run(pieces: &[&str]) -> Vec<String> {
        let mut assembler = StreamingAssembler::new("m");
        let mut frames = Vec::new();
        for piece in pieces {
            frames.extend(assembler.process(piece));
        }
        frames.extend(assembler.finish(Some(Usage::new(3, 4))));
        frames
    }

    fn content_of(frames: &[String]) -> String {
        frames
            .iter()
            .filter(|f| *f != DONE_FRAME)
            .map(|f| parse(f))
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect()
    }

    #[test]
    fn plain_text_streams_through_with_stop() {
        let frames = run(&["Hel", "lo the", "re"]);
        assert_eq!(content_of(&frames), "Hello there");
        assert_eq!(frames.last().unwrap(), DONE_FRAME);

        let terminal = parse(&frames[frames.len() - 2]);
        assert_eq!(terminal.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(terminal.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn first_chunk_carries_the_role() {
        let frames = run(&["hi"]);
        assert_eq!(parse(&frames[0]).choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(parse(&frames[1]).choices[0].delta.role.is_none());
    }

    fn tool_call_deltas(frames: &[String]) -> (String, String, Option<String>) {
        let mut name = String::new();
        let mut arguments = String::new();
        let mut finish = None;
        for frame in frames.iter().filter(|f| *f != DONE_FRAME) {
            let chunk = parse(frame);
            let choice = &chunk.choices[0];
            if let Some(calls) = &choice.delta.tool_calls {
                let call = &calls[0];
                if let Some(function) = &call.function {
                    if let Some(n) = &function.name {
                        name.push_str(n);
                    }
                    if let Some(a) = &function.arguments {
                        arguments.push_str(a);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                finish = choice.finish_reason.clone();
            }
        }
        (name, arguments, finish)
    }

    #[test]
    fn whole_tool_call_in_one_fragment() {
        let frames = run(&[
            r#"<tool_call>{"name": "get_time", "arguments": {"tz": "UTC"}}</tool_call>"#,
        ]);
        let (name, arguments, finish) = tool_call_deltas(&frames);
        assert_eq!(name, "get_time");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&arguments).unwrap(),
            serde_json::json!({"tz": "UTC"})
        );
        assert_eq!(finish.as_deref(), Some("tool_calls"));
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
    }

    #[test]
    fn tool_call_split_at_every_offset_reassembles_identically() {
        let raw = r#"Sure. <tool_call>{"name": "f", "arguments": {"a": 1}}</tool_call>"#;
        for split in 1..raw.len() {
            let (a, b) = raw.split_at(split);
            let frames = run(&[a, b]);
            let (name, arguments, finish) = tool_call_deltas(&frames);
            assert_eq!(name, "f", "split at {split}");
            assert_eq!(arguments, r#"{"a":1}"#, "split at {split}");
            assert_eq!(finish.as_deref(), Some("tool_calls"), "split at {split}");
            assert_eq!(content_of(&frames), "Sure. ", "split at {split}");
        }
    }

    #[test]
    fn held_back_marker_prefix_flushes_as_text_at_end() {
        let frames = run(&["answer is <tool_c"]);
        assert_eq!(content_of(&frames), "answer is <tool_c");
    }

    #[test]
    fn text_after_emitted_tool_call_is_ignored() {
        let frames = run(&[
            r#"<tool_call>{"name": "f", "arguments": {}}</tool_call>"#,
            " trailing prose",
        ]);
        assert_eq!(content_of(&frames), "");
    }

    #[test]
    fn malformed_tool_call_body_is_dropped_and_stream_continues() {
        let frames = run(&["a <tool_call>not json</tool_call> b"]);
        let (name, _, finish) = tool_call_deltas(&frames);
        assert!(name.is_empty());
        assert_eq!(content_of(&frames), "a  b");
        assert_eq!(finish.as_deref(), Some("stop"));
    }

    #[test]
    fn error_is_reported_in_band_before_done() {
        let mut assembler = StreamingAssembler::new("m");
        let mut frames = assembler.process("partial");
        frames.extend(assembler.error("backend error: engine failed"));
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
        let error_chunk = parse(&frames[frames.len() - 2]);
        assert_eq!(error_chunk.choices[0].finish_reason.as_deref(), Some("error"));
        assert!(error_chunk.choices[0]
            .delta
            .content
            .as_deref()
            .unwrap()
            .contains("engine failed"));
    }

    #[test]
    fn tool_call_id_has_stable_shape() {
        let frames = run(&[r#"<tool_call>{"name": "f", "arguments": {}}</tool_call>"#]);
        let head = parse(&frames[0]);
        let call = &head.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert!(call.id.as_deref().unwrap().starts_with("call_0_"));
        assert_eq!(call.kind.as_deref(), Some("function"));
    }
}
