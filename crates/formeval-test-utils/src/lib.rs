//! Testing utilities for formeval workspace
//!
//! Scripted collaborators that record calls and can hold each call until
//! the test releases it, plus small fixture builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use formeval_core::{
    ConditionalOutput, DynamicValueFetcher, DynamicValues, EvalError, EvaluationState, FetchError,
    FormEvalOutput, FormEvalRequest, FormEvaluator, FormId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// Calls seen by a scripted collaborator, with an optional gate
#[derive(Debug)]
struct CallLog<T> {
    calls: Mutex<Vec<T>>,
    started: watch::Sender<usize>,
    gate: Option<Semaphore>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl<T: Clone> CallLog<T> {
    fn new(gated: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            started: watch::channel(0).0,
            gate: gated.then(|| Semaphore::new(0)),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    async fn enter(&self, call: T) {
        let count = {
            let mut calls = self.calls.lock();
            calls.push(call);
            calls.len()
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.started.send_replace(count);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate semaphore closed").forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    async fn wait_for_calls(&self, count: usize) {
        let mut started = self.started.subscribe();
        started
            .wait_for(|n| *n >= count)
            .await
            .expect("call log sender dropped");
    }

    fn calls(&self) -> Vec<T> {
        self.calls.lock().clone()
    }
}

/// Scripted evaluator response
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return this output for the request's form
    Output(FormEvalOutput),
    /// Return an empty result
    Empty,
    /// Fail with this message
    Fail(String),
}

/// Evaluator that answers from a per-form script
///
/// Unscripted forms get [`default_output`]. Clones share the script and
/// call log.
#[derive(Debug, Clone)]
pub struct ScriptedEvaluator {
    script: Arc<Mutex<HashMap<FormId, Scripted>>>,
    log: Arc<CallLog<FormId>>,
    states_seen: Arc<Mutex<Vec<EvaluationState>>>,
}

impl ScriptedEvaluator {
    /// Evaluator that answers immediately
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Evaluator whose calls each wait for one [`release`](Self::release)
    pub fn gated() -> Self {
        Self::build(true)
    }

    fn build(gated: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(CallLog::new(gated)),
            states_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn respond(&self, form_id: impl Into<FormId>, output: FormEvalOutput) -> &Self {
        self.script.lock().insert(form_id.into(), Scripted::Output(output));
        self
    }

    pub fn respond_empty(&self, form_id: impl Into<FormId>) -> &Self {
        self.script.lock().insert(form_id.into(), Scripted::Empty);
        self
    }

    pub fn fail(&self, form_id: impl Into<FormId>, message: &str) -> &Self {
        self.script
            .lock()
            .insert(form_id.into(), Scripted::Fail(message.to_string()));
        self
    }

    /// Let `permits` held calls proceed
    pub fn release(&self, permits: usize) {
        self.log.release(permits);
    }

    /// Wait until at least `count` calls have started
    pub async fn wait_for_calls(&self, count: usize) {
        self.log.wait_for_calls(count).await;
    }

    /// Forms evaluated, in call order
    pub fn calls(&self) -> Vec<FormId> {
        self.log.calls()
    }

    /// Highest number of calls running at once
    pub fn max_concurrent(&self) -> usize {
        self.log.max_active.load(Ordering::SeqCst)
    }

    /// State passed to each call, in call order
    pub fn states_seen(&self) -> Vec<EvaluationState> {
        self.states_seen.lock().clone()
    }
}

impl Default for ScriptedEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FormEvaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        current: &EvaluationState,
        request: &FormEvalRequest,
    ) -> Result<Option<EvaluationState>, EvalError> {
        self.states_seen.lock().push(current.clone());
        self.log.enter(request.form_id.clone()).await;

        let scripted = self.script.lock().get(&request.form_id).cloned();
        match scripted {
            Some(Scripted::Output(output)) => Ok(Some(EvaluationState::single(
                request.form_id.clone(),
                output,
            ))),
            Some(Scripted::Empty) => Ok(None),
            Some(Scripted::Fail(message)) => Err(EvalError::evaluator(
                request.form_id.as_str(),
                message,
            )),
            None => Ok(Some(EvaluationState::single(
                request.form_id.clone(),
                default_output(),
            ))),
        }
    }
}

/// Scripted fetch response
#[derive(Debug, Clone)]
pub enum FetchResponse {
    Data(Value),
    Empty,
    Fail(String),
}

/// Fetcher that answers from a per-URL script
///
/// Unscripted URLs return `{"url": <url>}`.
#[derive(Debug, Clone)]
pub struct RecordingFetcher {
    script: Arc<Mutex<HashMap<String, FetchResponse>>>,
    log: Arc<CallLog<String>>,
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Fetcher whose calls each wait for one [`release`](Self::release)
    pub fn gated() -> Self {
        Self::build(true)
    }

    fn build(gated: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(CallLog::new(gated)),
        }
    }

    pub fn respond(&self, url: &str, response: FetchResponse) -> &Self {
        self.script.lock().insert(url.to_string(), response);
        self
    }

    pub fn release(&self, permits: usize) {
        self.log.release(permits);
    }

    pub async fn wait_for_calls(&self, count: usize) {
        self.log.wait_for_calls(count).await;
    }

    /// URLs fetched, in call order
    pub fn calls(&self) -> Vec<String> {
        self.log.calls()
    }

    pub fn max_concurrent(&self) -> usize {
        self.log.max_active.load(Ordering::SeqCst)
    }
}

impl Default for RecordingFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DynamicValueFetcher for RecordingFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Value>, FetchError> {
        self.log.enter(url.to_string()).await;

        let scripted = self.script.lock().get(url).cloned();
        match scripted {
            Some(FetchResponse::Data(data)) => Ok(Some(data)),
            Some(FetchResponse::Empty) => Ok(None),
            Some(FetchResponse::Fail(message)) => Err(FetchError::Transport {
                url: url.to_string(),
                message,
            }),
            None => Ok(Some(json!({ "url": url }))),
        }
    }
}

pub fn request(form_id: &str) -> FormEvalRequest {
    FormEvalRequest::new(form_id)
}

/// Output with a single visible field and no fetch instructions
pub fn default_output() -> FormEvalOutput {
    FormEvalOutput::new().with_field("field", ConditionalOutput::visible())
}

pub fn fetch_field(url: &str, allowed_to_fetch: bool) -> ConditionalOutput {
    ConditionalOutput::visible().with_dynamic_values(DynamicValues::new(url, allowed_to_fetch))
}

/// Output whose fields carry fetch instructions, in the given order
pub fn output_with_fetches(fields: &[(&str, &str, bool)]) -> FormEvalOutput {
    fields
        .iter()
        .fold(FormEvalOutput::new(), |output, (key, url, allowed)| {
            output.with_field(*key, fetch_field(url, *allowed))
        })
}

pub fn dynamic_values<'a>(output: &'a FormEvalOutput, key: &str) -> &'a DynamicValues {
    output
        .get(key)
        .and_then(|field| field.fetch_dynamic_values.as_ref())
        .expect("field has fetch instructions")
}
