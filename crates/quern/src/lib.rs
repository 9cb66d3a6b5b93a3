//! # quern
//!
//! Core library for the quern inference service: an OpenAI-compatible
//! chat-completion facade over a fixed-size pool of local inference
//! contexts.
//!
//! The pieces, leaves first:
//! - [`backend`] — the blocking completion capability behind a trait seam,
//!   plus a scripted fixture implementation for hermetic tests
//! - [`pool`] — fail-fast admission control over pooled [`pool::ExecutionContext`]s
//! - [`toolcall`] — extraction of `<tool_call>` tagged JSON from model text
//! - [`assemble`] — non-stream and streaming response assembly
//! - [`coordinator`] — the facade tying acquisition, generation and
//!   assembly together with guaranteed context release
//! - [`protocol`] — the OpenAI-compatible wire shapes
//! - [`config`] / [`artifact`] — YAML settings and pre-flight model download

pub mod artifact;
pub mod assemble;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod toolcall;

pub use coordinator::GenerationCoordinator;
pub use error::GenerateError;
