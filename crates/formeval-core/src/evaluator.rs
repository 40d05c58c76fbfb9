//! Evaluation collaborator
//!
//! The coalescer never computes form output itself. It hands the current
//! shared state and the request to a [`FormEvaluator`] and merges whatever
//! partial state comes back.

use crate::error::EvalError;
use crate::types::{EvaluationState, FormEvalRequest};
use async_trait::async_trait;
use std::sync::Arc;

/// Computes new partial evaluation state for a request
#[async_trait]
pub trait FormEvaluator: Send + Sync {
    /// Evaluate `request` against `current`
    ///
    /// # Returns
    /// Partial state to merge. `Ok(None)` or an empty state means there is
    /// nothing to merge.
    ///
    /// # Errors
    /// Any error drops the request; shared state is left unchanged.
    async fn evaluate(
        &self,
        current: &EvaluationState,
        request: &FormEvalRequest,
    ) -> Result<Option<EvaluationState>, EvalError>;
}

#[async_trait]
impl<E: FormEvaluator + ?Sized> FormEvaluator for Arc<E> {
    async fn evaluate(
        &self,
        current: &EvaluationState,
        request: &FormEvalRequest,
    ) -> Result<Option<EvaluationState>, EvalError> {
        (**self).evaluate(current, request).await
    }
}

/// Runs a synchronous compute function on tokio's blocking pool
///
/// This is the background-worker boundary: the function sees a snapshot of
/// the state and the request, and the caller suspends until it returns.
pub struct BlockingEvaluator<F> {
    compute: Arc<F>,
}

impl<F> BlockingEvaluator<F>
where
    F: Fn(&EvaluationState, &FormEvalRequest) -> Result<Option<EvaluationState>, EvalError>
        + Send
        + Sync
        + 'static,
{
    /// Wrap a compute function
    #[inline]
    #[must_use]
    pub fn new(compute: F) -> Self {
        Self {
            compute: Arc::new(compute),
        }
    }
}

impl<F> std::fmt::Debug for BlockingEvaluator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingEvaluator").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> FormEvaluator for BlockingEvaluator<F>
where
    F: Fn(&EvaluationState, &FormEvalRequest) -> Result<Option<EvaluationState>, EvalError>
        + Send
        + Sync
        + 'static,
{
    async fn evaluate(
        &self,
        current: &EvaluationState,
        request: &FormEvalRequest,
    ) -> Result<Option<EvaluationState>, EvalError> {
        let compute = Arc::clone(&self.compute);
        let current = current.clone();
        let request = request.clone();

        match tokio::task::spawn_blocking(move || compute(&current, &request)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(EvalError::WorkerPanicked(panic_message(e.into_panic()))),
            Err(_) => Err(EvalError::WorkerCancelled),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
