//! Deterministic scripted backend for hermetic tests.
//!
//! The factory replays a fixed, ordered sequence of outcomes shared across
//! all contexts it loads. Once the script is exhausted it keeps returning
//! a default reply, so exercising retry paths never hard-fails.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendFactory, CompletionBackend, GenerationParams, RawCompletion};
use crate::error::GenerateError;
use crate::protocol::Usage;

const DEFAULT_REPLY: &str = "Hello from the fixture backend.";

#[derive(Debug, Clone)]
enum Outcome {
    Reply(String),
    Error(String),
}

/// Builds [`FixtureBackend`] instances that replay a shared script.
#[derive(Default)]
pub struct FixtureFactory {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    fail_contexts: HashSet<usize>,
    delay: Option<Duration>,
    chunk_size: usize,
    resets: Arc<AtomicUsize>,
}

impl FixtureFactory {
    pub fn new() -> Self {
        Self {
            chunk_size: 8,
            ..Default::default()
        }
    }

    /// Queue a scripted completion text.
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Outcome::Reply(text.into()));
        self
    }

    /// Queue a scripted generation failure.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Outcome::Error(message.into()));
        self
    }

    /// Hold each generation open for `delay` before producing output.
    /// Used to keep contexts checked out in admission-control tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Byte size of the delta fragments `generate_stream` produces.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Make `load` fail for the given context id, for partial-init tests.
    pub fn fail_context(mut self, context_id: usize) -> Self {
        self.fail_contexts.insert(context_id);
        self
    }

    /// Total `reset()` calls observed across every loaded backend.
    pub fn reset_count(&self) -> Arc<AtomicUsize> {
        self.resets.clone()
    }
}

impl BackendFactory for FixtureFactory {
    fn load(&self, context_id: usize) -> Result<Box<dyn CompletionBackend>, GenerateError> {
        if self.fail_contexts.contains(&context_id) {
            return Err(GenerateError::Initialization(format!(
                "fixture context {context_id} configured to fail"
            )));
        }
        Ok(Box::new(FixtureBackend {
            script: self.script.clone(),
            delay: self.delay,
            chunk_size: self.chunk_size,
            resets: self.resets.clone(),
        }))
    }
}

pub struct FixtureBackend {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    delay: Option<Duration>,
    chunk_size: usize,
    resets: Arc<AtomicUsize>,
}

impl FixtureBackend {
    fn next_outcome(&self) -> Outcome {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Outcome::Reply(DEFAULT_REPLY.to_string()))
    }
}

impl CompletionBackend for FixtureBackend {
    fn generate(&mut self, _params: &GenerationParams) -> Result<RawCompletion, GenerateError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match self.next_outcome() {
            Outcome::Reply(text) => Ok(RawCompletion {
                text,
                finish_reason: Some("stop".to_string()),
                usage: Some(Usage::new(0, 0)),
            }),
            Outcome::Error(message) => Err(GenerateError::Backend(message)),
        }
    }

    fn generate_stream(
        &mut self,
        _params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Option<Usage>, GenerateError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let text = match self.next_outcome() {
            Outcome::Reply(text) => text,
            Outcome::Error(message) => return Err(GenerateError::Backend(message)),
        };

        let mut rest = text.as_str();
        while !rest.is_empty() {
            let mut split = self.chunk_size.min(rest.len());
            while !rest.is_char_boundary(split) {
                split += 1;
            }
            let (piece, tail) = rest.split_at(split);
            if !sink(piece) {
                return Ok(None);
            }
            rest = tail;
        }
        Ok(Some(Usage::new(0, 0)))
    }

    fn reset(&mut self) -> Result<(), GenerateError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
