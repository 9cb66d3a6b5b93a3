//! Fixed-size pool of inference contexts with fail-fast admission control.
//!
//! The pool partitions its contexts into *available* and *in-use* at all
//! times; `active_requests` always equals the in-use count, and both are
//! bounded by the effective capacity. There is no queueing: a request
//! arriving at a saturated pool gets [`GenerateError::PoolExhausted`]
//! immediately, which the HTTP layer turns into an explicit 503
//! backpressure signal.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::backend::{BackendFactory, CompletionBackend, GenerationParams, RawCompletion};
use crate::error::GenerateError;
use crate::protocol::Usage;

/// One unit of pooled, stateful access to the inference backend.
///
/// Owned exclusively by the pool; callers only ever touch it through a
/// [`PooledContext`] borrow, so generation on a single context is strictly
/// sequential without any per-context lock.
pub struct ExecutionContext {
    id: usize,
    backend: Box<dyn CompletionBackend>,
    ready: bool,
    last_session: Option<String>,
}

impl ExecutionContext {
    fn new(id: usize, backend: Box<dyn CompletionBackend>) -> Self {
        Self {
            id,
            backend,
            ready: true,
            last_session: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Align the context with the request's session. A context that last
    /// served a different session gets its cache cleared first; reuse
    /// within the same session keeps the cache warm. Returns whether a
    /// reset happened.
    pub fn ensure_session(&mut self, session_id: &str) -> Result<bool, GenerateError> {
        let needs_reset = self
            .last_session
            .as_deref()
            .is_some_and(|last| last != session_id);
        if needs_reset {
            tracing::debug!(context_id = self.id, "resetting context for new session");
            self.reset()?;
        }
        self.last_session = Some(session_id.to_string());
        Ok(needs_reset)
    }

    pub fn generate(&mut self, params: &GenerationParams) -> Result<RawCompletion, GenerateError> {
        self.backend.generate(params)
    }

    pub fn generate_stream(
        &mut self,
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<Option<Usage>, GenerateError> {
        self.backend.generate_stream(params, sink)
    }

    /// Clear backend cache state. A context whose reset fails is marked
    /// not-ready and will be dropped from rotation on release.
    pub fn reset(&mut self) -> Result<(), GenerateError> {
        if let Err(e) = self.backend.reset() {
            tracing::warn!(context_id = self.id, error = %e, "context reset failed");
            self.ready = false;
            return Err(e);
        }
        self.last_session = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub in_use: usize,
    pub active_requests: usize,
    pub capacity: usize,
    /// Capacity the pool was configured with, before initialization
    /// failures or degraded contexts shrank it.
    pub pool_size: usize,
}

#[derive(Default)]
struct PoolState {
    available: Vec<ExecutionContext>,
    in_use: usize,
    active_requests: usize,
    /// Effective capacity: successful initializations minus contexts
    /// dropped from rotation.
    capacity: usize,
    initialized: bool,
    initialization_failed: bool,
}

/// Pool of [`ExecutionContext`]s. All shared mutable state lives behind a
/// single bookkeeping lock; the lock is never held across a backend call.
pub struct ModelPool {
    pool_size: usize,
    state: Mutex<PoolState>,
}

impl ModelPool {
    pub fn new(pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool_size,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Create and initialize all contexts in parallel. Partial failure is
    /// tolerated: the pool becomes ready with a reduced capacity as long
    /// as at least one context loads. Zero successes fail initialization
    /// outright.
    pub async fn initialize(&self, factory: Arc<dyn BackendFactory>) -> Result<(), GenerateError> {
        tracing::info!(pool_size = self.pool_size, "initializing model pool");

        let mut tasks = Vec::with_capacity(self.pool_size);
        for id in 0..self.pool_size {
            let factory = factory.clone();
            tasks.push(tokio::task::spawn_blocking(move || (id, factory.load(id))));
        }

        let mut contexts = Vec::new();
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok((id, Ok(backend))) => contexts.push(ExecutionContext::new(id, backend)),
                Ok((id, Err(e))) => {
                    tracing::error!(context_id = id, error = %e, "failed to initialize context");
                }
                Err(e) => {
                    tracing::error!(error = %e, "context initialization task panicked");
                }
            }
        }

        let successes = contexts.len();
        let mut state = self.state.lock().unwrap();
        if successes == 0 {
            state.initialization_failed = true;
            return Err(GenerateError::Initialization(
                "no contexts could be initialized".to_string(),
            ));
        }

        if successes < self.pool_size {
            tracing::warn!(
                requested = self.pool_size,
                initialized = successes,
                "model pool initialized with reduced capacity"
            );
        } else {
            tracing::info!(capacity = successes, "model pool initialized");
        }

        state.capacity = successes;
        state.available = contexts;
        state.initialized = true;
        state.initialization_failed = false;
        Ok(())
    }

    /// Take a context out of the pool, or fail immediately. No blocking,
    /// no queueing: saturation is reported to the caller as backpressure.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledContext, GenerateError> {
        let mut state = self.state.lock().unwrap();

        if !state.initialized || state.initialization_failed {
            return Err(GenerateError::NotReady);
        }
        if state.active_requests >= state.capacity {
            return Err(GenerateError::PoolExhausted {
                active: state.active_requests,
                max: state.capacity,
            });
        }
        let Some(context) = state.available.pop() else {
            return Err(GenerateError::PoolExhausted {
                active: state.active_requests,
                max: state.capacity,
            });
        };
        state.in_use += 1;
        state.active_requests += 1;
        tracing::debug!(
            context_id = context.id,
            active_requests = state.active_requests,
            "acquired context"
        );

        Ok(PooledContext {
            context: Some(context),
            pool: self.clone(),
        })
    }

    fn release(&self, context: ExecutionContext) {
        let mut state = self.state.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(1);
        state.active_requests = state.active_requests.saturating_sub(1);

        if !state.initialized {
            // Returned after cleanup; nothing to put it back into.
            drop(state);
            drop(context);
            return;
        }

        if context.ready {
            tracing::debug!(
                context_id = context.id,
                active_requests = state.active_requests,
                "released context"
            );
            state.available.push(context);
        } else {
            state.capacity = state.capacity.saturating_sub(1);
            tracing::warn!(
                context_id = context.id,
                capacity = state.capacity,
                "released context is not ready, dropping it from rotation"
            );
        }
    }

    /// Tear down every context concurrently and reset all pool state.
    pub async fn cleanup(&self) {
        let contexts = {
            let mut state = self.state.lock().unwrap();
            let contexts = std::mem::take(&mut state.available);
            *state = PoolState::default();
            contexts
        };

        let tasks: Vec<_> = contexts
            .into_iter()
            .map(|ctx| tokio::task::spawn_blocking(move || drop(ctx)))
            .collect();
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "context teardown task panicked");
            }
        }
        tracing::info!("model pool cleaned up");
    }

    /// Structurally present: initialization completed with at least one
    /// context, whether or not one is free right now.
    pub fn is_loaded(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.initialized && state.capacity > 0
    }

    /// Actually available for new work.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.initialized && !state.initialization_failed && !state.available.is_empty()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        PoolStatus {
            available: state.available.len(),
            in_use: state.in_use,
            active_requests: state.active_requests,
            capacity: state.capacity,
            pool_size: self.pool_size,
        }
    }
}

/// RAII borrow of an [`ExecutionContext`]. Dropping the guard returns the
/// context to the pool, which makes release structural: it happens on
/// every exit path, panics included.
pub struct PooledContext {
    context: Option<ExecutionContext>,
    pool: Arc<ModelPool>,
}

impl Deref for PooledContext {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        self.context.as_ref().expect("context present until drop")
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context.as_mut().expect("context present until drop")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
