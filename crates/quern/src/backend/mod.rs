//! The blocking inference capability behind a trait seam.
//!
//! A [`CompletionBackend`] is the opaque engine that turns a prompt into
//! text. Calls block for the full duration of inference, so the pool and
//! coordinator always drive them from `spawn_blocking` workers. Each
//! backend instance holds its own cache state; [`CompletionBackend::reset`]
//! must be called before reusing an instance for an unrelated session.

pub mod fixture;
#[cfg(feature = "llama")]
pub mod llama;

use crate::error::GenerateError;
use crate::protocol::{Message, ToolDefinition, Usage};

/// Sampling parameters and conversation for one generation, resolved
/// against config defaults before they reach the backend.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// One complete raw completion from the backend. `text` may embed
/// `<tool_call>` tagged segments; extraction happens in the assemblers,
/// never here.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Blocking completion engine. Exactly one call is in flight per instance;
/// the pool's in-use partition enforces that, so implementations do not
/// need their own serialization lock.
pub trait CompletionBackend: Send {
    /// Run one full generation and return the complete text.
    fn generate(&mut self, params: &GenerationParams) -> Result<RawCompletion, GenerateError>;

    /// Run one generation, handing each raw delta fragment to `sink` as it
    /// is produced. A `false` return from `sink` stops generation early
    /// (the consumer went away). Returns usage if the engine tracked it.
    fn generate_stream(
        &mut self,
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Option<Usage>, GenerateError>;

    /// Clear cache state carried over from previous generations. Skipping
    /// this between unrelated sessions is a correctness bug, not a
    /// performance one.
    fn reset(&mut self) -> Result<(), GenerateError>;
}

/// Loads backend instances for the pool. `load` blocks (model files are
/// large); the pool calls it from `spawn_blocking`, one task per context.
pub trait BackendFactory: Send + Sync + 'static {
    fn load(&self, context_id: usize) -> Result<Box<dyn CompletionBackend>, GenerateError>;
}
