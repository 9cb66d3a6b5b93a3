//! llama.cpp backend.
//!
//! Weights are loaded once and shared; every generation creates a fresh
//! llama context, prefills the prompt in batch-sized chunks and then runs
//! the autoregressive loop token by token. Because no KV state outlives a
//! single call, `reset` has nothing to clear.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;

use crate::backend::{BackendFactory, CompletionBackend, GenerationParams, RawCompletion};
use crate::error::GenerateError;
use crate::protocol::{Role, ToolDefinition, Usage};

/// Owns the process-wide llama backend. Only a `Weak` is stored globally;
/// strong references live in factories, so the backend is freed when the
/// last factory drops.
pub struct LlamaRuntime {
    backend: LlamaBackend,
}

static RUNTIME: Mutex<Weak<LlamaRuntime>> = Mutex::new(Weak::new());

impl LlamaRuntime {
    fn get_or_init() -> Result<Arc<Self>, GenerateError> {
        let mut guard = RUNTIME.lock().map_err(|_| {
            GenerateError::Initialization("llama runtime lock poisoned".to_string())
        })?;
        if let Some(runtime) = guard.upgrade() {
            return Ok(runtime);
        }
        let backend = LlamaBackend::init()
            .map_err(|e| GenerateError::Initialization(format!("llama backend init: {e}")))?;
        let runtime = Arc::new(Self { backend });
        *guard = Arc::downgrade(&runtime);
        Ok(runtime)
    }

    fn backend(&self) -> &LlamaBackend {
        &self.backend
    }
}

#[derive(Debug, Clone)]
pub struct LlamaConfig {
    pub model_path: PathBuf,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub n_threads: Option<u32>,
}

/// Loads the model once and hands out backends that share its weights.
pub struct LlamaFactory {
    runtime: Arc<LlamaRuntime>,
    model: Arc<LlamaModel>,
    config: LlamaConfig,
}

impl LlamaFactory {
    pub fn new(config: LlamaConfig) -> Result<Self, GenerateError> {
        if !config.model_path.exists() {
            return Err(GenerateError::Initialization(format!(
                "model file not found: {}",
                config.model_path.display()
            )));
        }
        let runtime = LlamaRuntime::get_or_init()?;
        tracing::info!(path = %config.model_path.display(), "loading model weights");

        let mut params = LlamaModelParams::default();
        if config.gpu_layers > 0 {
            params = params.with_n_gpu_layers(config.gpu_layers);
        }
        let model = LlamaModel::load_from_file(runtime.backend(), &config.model_path, &params)
            .map_err(|e| GenerateError::Initialization(format!("failed to load model: {e}")))?;
        tracing::info!("model weights loaded");

        Ok(Self {
            runtime,
            model: Arc::new(model),
            config,
        })
    }
}

impl BackendFactory for LlamaFactory {
    fn load(&self, context_id: usize) -> Result<Box<dyn CompletionBackend>, GenerateError> {
        let template = match self.model.chat_template(None) {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!(context_id, "model has no embedded chat template, using chatml");
                LlamaChatTemplate::new("chatml").map_err(|e| {
                    GenerateError::Initialization(format!("fallback chat template: {e}"))
                })?
            }
        };
        Ok(Box::new(LlamaCppBackend {
            runtime: self.runtime.clone(),
            model: self.model.clone(),
            template,
            config: self.config.clone(),
        }))
    }
}

pub struct LlamaCppBackend {
    runtime: Arc<LlamaRuntime>,
    model: Arc<LlamaModel>,
    template: LlamaChatTemplate,
    config: LlamaConfig,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Function => "function",
    }
}

/// Tool declarations go into the system prompt in the tagged format the
/// assemblers expect back out of the model.
fn tools_preamble(tools: &[ToolDefinition]) -> String {
    let specs: Vec<String> = tools
        .iter()
        .filter_map(|t| serde_json::to_string(&t.function).ok())
        .collect();
    format!(
        "You have access to the following tools:\n{}\n\
         To call a tool, respond with <tool_call>{{\"name\": <tool name>, \
         \"arguments\": <argument object>}}</tool_call>.",
        specs.join("\n")
    )
}

impl LlamaCppBackend {
    fn chat_messages(
        &self,
        params: &GenerationParams,
    ) -> Result<Vec<LlamaChatMessage>, GenerateError> {
        let mut chat = Vec::with_capacity(params.messages.len() + 1);
        if let Some(tools) = params.tools.as_deref().filter(|t| !t.is_empty()) {
            chat.push(
                LlamaChatMessage::new("system".to_string(), tools_preamble(tools))
                    .map_err(|e| GenerateError::Backend(format!("chat message: {e}")))?,
            );
        }
        for message in &params.messages {
            let content = message.content.clone().unwrap_or_default();
            chat.push(
                LlamaChatMessage::new(role_name(message.role).to_string(), content)
                    .map_err(|e| GenerateError::Backend(format!("chat message: {e}")))?,
            );
        }
        Ok(chat)
    }

    fn sampler(&self, params: &GenerationParams) -> LlamaSampler {
        let mut samplers: Vec<LlamaSampler> = Vec::new();
        if params.frequency_penalty != 0.0 || params.presence_penalty != 0.0 {
            samplers.push(LlamaSampler::penalties(
                64,
                1.0,
                params.frequency_penalty,
                params.presence_penalty,
            ));
        }
        if params.temperature <= 0.0 {
            samplers.push(LlamaSampler::greedy());
        } else {
            samplers.push(LlamaSampler::temp(params.temperature));
            samplers.push(LlamaSampler::dist(0));
        }
        if samplers.len() == 1 {
            samplers.remove(0)
        } else {
            LlamaSampler::chain_simple(samplers)
        }
    }

    fn run(
        &self,
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Option<Usage>, GenerateError> {
        let chat = self.chat_messages(params)?;
        let prompt = self
            .model
            .apply_chat_template(&self.template, &chat, true)
            .map_err(|e| GenerateError::Backend(format!("failed to apply chat template: {e}")))?;
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Never)
            .map_err(|e| GenerateError::Backend(format!("failed to tokenize prompt: {e}")))?;
        let prompt_token_count = tokens.len();

        if prompt_token_count as u32 >= self.config.ctx_size {
            return Err(GenerateError::Backend(format!(
                "prompt ({prompt_token_count} tokens) does not fit the context ({} tokens)",
                self.config.ctx_size
            )));
        }

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.config.ctx_size));
        if let Some(n_threads) = self.config.n_threads {
            ctx_params = ctx_params.with_n_threads(n_threads as i32);
            ctx_params = ctx_params.with_n_threads_batch(n_threads as i32);
        }
        let mut ctx = self
            .model
            .new_context(self.runtime.backend(), ctx_params)
            .map_err(|e| GenerateError::Backend(format!("failed to create context: {e}")))?;

        let n_batch = ctx.n_batch() as usize;
        for chunk in tokens.chunks(n_batch) {
            let mut batch = LlamaBatch::get_one(chunk)
                .map_err(|e| GenerateError::Backend(format!("failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| GenerateError::Backend(format!("prefill decode failed: {e}")))?;
        }

        let mut sampler = self.sampler(params);
        let budget = (self.config.ctx_size as usize)
            .saturating_sub(prompt_token_count)
            .min(params.max_tokens as usize);
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut output_token_count: u32 = 0;

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);

            if self.model.is_eog_token(token) {
                break;
            }
            output_token_count += 1;

            let piece = self
                .model
                .token_to_piece(token, &mut decoder, true, None)
                .map_err(|e| GenerateError::Backend(format!("failed to decode token: {e}")))?;
            if !piece.is_empty() && !sink(&piece) {
                break;
            }

            let next_tokens = [token];
            let mut batch = LlamaBatch::get_one(&next_tokens)
                .map_err(|e| GenerateError::Backend(format!("failed to create batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| GenerateError::Backend(format!("decode failed: {e}")))?;
        }

        Ok(Some(Usage::new(
            prompt_token_count as u32,
            output_token_count,
        )))
    }
}

impl CompletionBackend for LlamaCppBackend {
    fn generate(&mut self, params: &GenerationParams) -> Result<RawCompletion, GenerateError> {
        let mut text = String::new();
        let usage = self.run(params, &mut |piece| {
            text.push_str(piece);
            true
        })?;
        Ok(RawCompletion {
            text,
            finish_reason: Some("stop".to_string()),
            usage,
        })
    }

    fn generate_stream(
        &mut self,
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Option<Usage>, GenerateError> {
        self.run(params, sink)
    }

    fn reset(&mut self) -> Result<(), GenerateError> {
        // Each generation builds its own context, so no KV cache survives
        // between calls.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_fails_initialization() {
        let result = LlamaFactory::new(LlamaConfig {
            model_path: PathBuf::from("/nonexistent/model.gguf"),
            ctx_size: 4096,
            gpu_layers: 0,
            n_threads: None,
        });
        assert!(matches!(result.err(), Some(GenerateError::Initialization(_))));
    }

    #[test]
    fn tools_preamble_names_every_tool() {
        let tools = vec![ToolDefinition {
            kind: "function".to_string(),
            function: crate::protocol::FunctionDefinition {
                name: "get_time".to_string(),
                description: Some("Current time".to_string()),
                parameters: None,
            },
        }];
        let preamble = tools_preamble(&tools);
        assert!(preamble.contains("get_time"));
        assert!(preamble.contains("<tool_call>"));
    }

    #[test]
    fn role_names_match_wire_format() {
        assert_eq!(role_name(Role::System), "system");
        assert_eq!(role_name(Role::Tool), "tool");
    }
}
