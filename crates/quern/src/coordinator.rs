//! Request orchestration: admission, session hygiene, generation and
//! response assembly.
//!
//! The coordinator is the only place that touches the pool, the blocking
//! backend and the assemblers together. Generation always runs on the
//! blocking thread pool; streaming output crosses back into async land
//! through a bounded channel, which doubles as backpressure and as
//! disconnect detection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::assemble::{StreamingAssembler, assemble_response};
use crate::backend::{BackendFactory, GenerationParams};
use crate::error::GenerateError;
use crate::pool::{ModelPool, PoolStatus};
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Defaults applied when a request omits or mis-ranges a sampling knob.
#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 256,
        }
    }
}

pub struct GenerationCoordinator {
    pool: Arc<ModelPool>,
    model_name: String,
    defaults: GenerationDefaults,
}

impl GenerationCoordinator {
    /// Build the pool and load every context before accepting work.
    pub async fn initialize(
        factory: Arc<dyn BackendFactory>,
        model_name: impl Into<String>,
        defaults: GenerationDefaults,
        pool_size: usize,
    ) -> Result<Self, GenerateError> {
        let pool = ModelPool::new(pool_size);
        pool.initialize(factory).await?;
        Ok(Self {
            pool,
            model_name: model_name.into(),
            defaults,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn is_loaded(&self) -> bool {
        self.pool.is_loaded()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn shutdown(&self) {
        self.pool.cleanup().await;
    }

    /// Resolve request knobs against configured defaults. Out-of-range
    /// values fall back rather than erroring, logged so misbehaving
    /// clients leave a trace.
    fn prepare_params(&self, request: &ChatCompletionRequest) -> GenerationParams {
        let temperature = match request.temperature {
            Some(t) if (0.0..=2.0).contains(&t) => t,
            Some(t) => {
                tracing::warn!(temperature = t, "temperature out of range, using default");
                self.defaults.temperature
            }
            None => self.defaults.temperature,
        };
        let max_tokens = match request.max_tokens {
            Some(m) if m >= 1 => m,
            Some(m) => {
                tracing::warn!(max_tokens = m, "max_tokens out of range, using default");
                self.defaults.max_tokens
            }
            None => self.defaults.max_tokens,
        };
        GenerationParams {
            messages: request.messages.clone(),
            temperature,
            max_tokens,
            frequency_penalty: penalty(request.frequency_penalty, "frequency_penalty"),
            presence_penalty: penalty(request.presence_penalty, "presence_penalty"),
            tools: request.tools.clone(),
        }
    }

    /// One non-streaming completion. Fails fast when the pool is
    /// saturated; a backend failure resets the context before it goes
    /// back into rotation.
    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GenerateError> {
        let params = self.prepare_params(&request);
        let mut context = self.pool.acquire()?;
        let session_id = format!("non_stream_{}", Uuid::new_v4());

        let raw = tokio::task::spawn_blocking(move || {
            context.ensure_session(&session_id)?;
            match context.generate(&params) {
                Ok(raw) => Ok(raw),
                Err(e) => {
                    // Leave no request residue behind for the next caller.
                    let _ = context.reset();
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| GenerateError::Backend(format!("generation task panicked: {e}")))??;

        Ok(assemble_response(&self.model_name, raw))
    }

    /// One streaming completion. Admission control happens here, before
    /// any response bytes exist, so saturation still surfaces as a real
    /// HTTP status. Whatever fails after that is reported in-band.
    pub async fn complete_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ReceiverStream<String>, GenerateError> {
        let params = self.prepare_params(&request);
        let mut context = self.pool.acquire()?;
        let session_id = format!("stream_{}", Uuid::new_v4());
        let model = self.model_name.clone();
        let (tx, rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut assembler = StreamingAssembler::new(&model);

            if let Err(e) = context.ensure_session(&session_id) {
                for frame in assembler.error(&e.to_string()) {
                    let _ = tx.blocking_send(frame);
                }
                return;
            }

            let result = {
                let sink_tx = tx.clone();
                let assembler = &mut assembler;
                context.generate_stream(&params, &mut |piece| {
                    for frame in assembler.process(piece) {
                        // A closed channel means the client went away;
                        // stop the backend instead of generating into
                        // the void.
                        if sink_tx.blocking_send(frame).is_err() {
                            return false;
                        }
                    }
                    true
                })
            };

            let frames = match result {
                Ok(usage) => assembler.finish(usage),
                Err(e) => {
                    tracing::error!(error = %e, "streaming generation failed");
                    let _ = context.reset();
                    assembler.error(&e.to_string())
                }
            };
            for frame in frames {
                if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn penalty(value: Option<f32>, knob: &str) -> f32 {
    match value {
        Some(p) if (-2.0..=2.0).contains(&p) => p,
        Some(p) => {
            tracing::warn!(knob, value = p, "penalty out of range, using 0.0");
            0.0
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fixture::FixtureFactory;
    use crate::protocol::{FunctionDefinition, ToolDefinition};
    use futures::StreamExt;
    use std::sync::atomic::Ordering;

    fn request(content: &str) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": content}]
        }))
        .unwrap()
    }

    fn with_tools(mut request: ChatCompletionRequest) -> ChatCompletionRequest {
        request.tools = Some(vec![ToolDefinition {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: "get_time".to_string(),
                description: None,
                parameters: None,
            },
        }]);
        request
    }

    async fn coordinator(factory: FixtureFactory) -> GenerationCoordinator {
        GenerationCoordinator::initialize(
            Arc::new(factory),
            "test-model",
            GenerationDefaults::default(),
            1,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn complete_returns_assembled_response() {
        let coordinator = coordinator(FixtureFactory::new().with_reply("scripted answer")).await;
        let response = coordinator.complete(request("hi")).await.unwrap();
        assert_eq!(response.model, "test-model");
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("scripted answer")
        );

        let status = coordinator.pool_status();
        assert_eq!(status.available, 1);
        assert_eq!(status.active_requests, 0);
    }

    #[tokio::test]
    async fn complete_extracts_tool_calls_when_tools_are_declared() {
        let reply = r#"<tool_call>{"name": "get_time", "arguments": {"tz": "UTC"}}</tool_call>"#;
        let coordinator = coordinator(FixtureFactory::new().with_reply(reply)).await;
        let response = coordinator.complete(with_tools(request("time?"))).await.unwrap();
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_time");
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[tokio::test]
    async fn backend_failure_resets_context_and_surfaces_error() {
        let factory = FixtureFactory::new()
            .with_error("engine failed")
            .with_reply("recovered");
        let resets = factory.reset_count();
        let coordinator = coordinator(factory).await;

        let err = coordinator.complete(request("boom")).await.unwrap_err();
        assert!(matches!(err, GenerateError::Backend(_)));
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        // The pool recovered; the next request goes through.
        let response = coordinator.complete(request("again")).await.unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("recovered")
        );
    }

    #[tokio::test]
    async fn stream_emits_frames_and_done() {
        let coordinator = coordinator(FixtureFactory::new().with_reply("streamed text")).await;
        let stream = coordinator.complete_stream(request("hi")).await.unwrap();
        let frames: Vec<String> = stream.collect().await;

        assert!(!frames.is_empty());
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
        let body: String = frames.concat();
        assert!(body.contains("streamed text") || body.contains("streamed"));
    }

    #[tokio::test]
    async fn stream_reassembles_tool_call_split_across_fragments() {
        let reply = r#"<tool_call>{"name": "get_time", "arguments": {"tz": "UTC"}}</tool_call>"#;
        let factory = FixtureFactory::new().with_reply(reply).with_chunk_size(3);
        let coordinator = coordinator(factory).await;
        let stream = coordinator
            .complete_stream(with_tools(request("time?")))
            .await
            .unwrap();
        let body: String = stream.collect::<Vec<String>>().await.concat();

        assert!(body.contains(r#""name":"get_time""#));
        assert!(body.contains(r#""finish_reason":"tool_calls""#));
        assert!(!body.contains("<tool_call>"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn stream_synthesizes_tool_call_even_without_declared_tools() {
        let reply = r#"<tool_call>{"name": "get_time", "arguments": {}}</tool_call>"#;
        let coordinator = coordinator(FixtureFactory::new().with_reply(reply)).await;
        let stream = coordinator.complete_stream(request("time?")).await.unwrap();
        let body: String = stream.collect::<Vec<String>>().await.concat();

        assert!(body.contains(r#""name":"get_time""#));
        assert!(body.contains(r#""finish_reason":"tool_calls""#));
        assert!(!body.contains("<tool_call>"));
    }

    #[tokio::test]
    async fn stream_backend_failure_is_reported_in_band() {
        let coordinator = coordinator(FixtureFactory::new().with_error("engine failed")).await;
        let stream = coordinator.complete_stream(request("boom")).await.unwrap();
        let body: String = stream.collect::<Vec<String>>().await.concat();
        assert!(body.contains("engine failed"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn saturated_pool_rejects_before_streaming() {
        let coordinator = coordinator(
            FixtureFactory::new().with_delay(std::time::Duration::from_millis(200)),
        )
        .await;
        let _held = coordinator.pool.acquire().unwrap();
        let err = coordinator.complete_stream(request("hi")).await.unwrap_err();
        assert!(matches!(err, GenerateError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn out_of_range_knobs_fall_back_to_defaults() {
        let coordinator = coordinator(FixtureFactory::new()).await;
        let mut req = request("hi");
        req.temperature = Some(9.5);
        req.max_tokens = Some(0);
        req.frequency_penalty = Some(-3.0);
        let params = coordinator.prepare_params(&req);
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.frequency_penalty, 0.0);
    }

    #[tokio::test]
    async fn contexts_are_reset_between_requests_with_distinct_sessions() {
        let factory = FixtureFactory::new();
        let resets = factory.reset_count();
        let coordinator = coordinator(factory).await;

        coordinator.complete(request("one")).await.unwrap();
        coordinator.complete(request("two")).await.unwrap();

        // The first request finds a fresh context; only the second needs
        // to clear the state the first left behind.
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }
}
