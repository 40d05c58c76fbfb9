//! Synthetic workload
//!
//! Drives a seeded stream of evaluation requests through the listener with
//! a synthetic evaluator and fetcher, then checks the coalescer ended idle
//! with every successfully evaluated form present in the state.

use async_trait::async_trait;
use formeval_core::{
    BlockingEvaluator, CoalescerStats, ConditionalOutput, DynamicValueFetcher, DynamicValues,
    EvalError, EvaluationState, FetchError, FormEvalConfig, FormEvalOutput, FormEvalRequest,
    FormEvaluationCoalescer, FormEvaluationListener, FormId, ListenerReport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Seed for reproducibility
    pub seed: u64,
    /// Requests to send
    pub requests: u64,
    /// Distinct forms requests are spread over
    pub forms: usize,
    /// Fields per form output
    pub fields: usize,
    /// Evaluator latency; fetches take half of it
    pub latency_ms: u64,
    /// Probability that an evaluation fails
    pub failure_rate: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            requests: 100,
            forms: 4,
            fields: 4,
            latency_ms: 1,
            failure_rate: 0.05,
        }
    }
}

/// Simulation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorReport {
    /// Parameters used
    pub config: SimulatorConfig,
    /// Listener counters
    pub listener: ListenerReport,
    /// Coalescer counters
    pub stats: CoalescerStats,
    /// Forms present in the final state
    pub forms_in_state: usize,
    /// Forms with at least one successful evaluation but no state
    pub missing_forms: Vec<FormId>,
    /// Whether the coalescer ended idle
    pub ended_idle: bool,
    /// Wall clock time
    pub elapsed_ms: u128,
}

impl SimulatorReport {
    /// Whether the run met its checks
    #[must_use]
    pub fn passed(&self) -> bool {
        self.ended_idle && self.missing_forms.is_empty()
    }

    /// Human readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        out.push_str("Form Evaluation Simulation Report\n");
        out.push_str("=================================\n");
        out.push_str(&format!("Seed: {}\n", self.config.seed));
        out.push_str(&format!("Requests: {}\n", self.config.requests));
        out.push_str(&format!("Forms: {}\n", self.config.forms));
        out.push_str(&format!("Elapsed: {}ms\n\n", self.elapsed_ms));
        out.push_str(&format!("Submitted: {}\n", s.submitted));
        out.push_str(&format!("  Queued: {}\n", s.queued));
        out.push_str(&format!("  Evaluated: {}\n", s.evaluated));
        out.push_str(&format!("  Failed: {}\n", s.failed));
        out.push_str(&format!("  Empty results: {}\n", s.empty_results));
        out.push_str(&format!("Leader tasks: {}\n", self.listener.drives_spawned));
        out.push_str(&format!(
            "Fetches: {} started, {} succeeded, {} failed\n",
            s.fetches_started, s.fetches_succeeded, s.fetches_failed
        ));
        out.push_str(&format!("Updates published: {}\n\n", s.updates_published));
        out.push_str(&format!("Forms in state: {}\n", self.forms_in_state));
        out.push_str(&format!("Ended idle: {}\n", self.ended_idle));
        if !self.missing_forms.is_empty() {
            let missing: Vec<&str> = self.missing_forms.iter().map(FormId::as_str).collect();
            out.push_str(&format!("Missing forms: {}\n", missing.join(", ")));
        }
        out.push_str(&format!(
            "Status: {}\n",
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        out
    }
}

/// Fetcher that answers every URL after a fixed delay
#[derive(Debug, Clone, Copy)]
struct SimulatedFetcher {
    latency: Duration,
}

#[async_trait]
impl DynamicValueFetcher for SimulatedFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Value>, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(Some(json!({ "url": url, "options": ["one", "two"] })))
    }
}

/// Synthetic compute: fails when the request says so, otherwise emits
/// `fields` fields, every other one fetchable
fn simulated_compute(
    fields: usize,
    latency: Duration,
) -> impl Fn(&EvaluationState, &FormEvalRequest) -> Result<Option<EvaluationState>, EvalError>
       + Send
       + Sync
       + 'static {
    move |_current: &EvaluationState, request: &FormEvalRequest| {
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let config = request.action_configuration.as_ref();
        if config.and_then(|c| c["fail"].as_bool()).unwrap_or(false) {
            return Err(EvalError::evaluator(
                request.form_id.as_str(),
                "simulated evaluator failure",
            ));
        }
        let revision = config.and_then(|c| c["revision"].as_u64()).unwrap_or(0);

        let output = (0..fields).fold(FormEvalOutput::new(), |output, i| {
            let mut field = ConditionalOutput::visible();
            field.enabled = Some((revision + i as u64) % 3 != 0);
            if i % 2 == 0 {
                field = field.with_dynamic_values(DynamicValues::new(
                    format!("/forms/{}/fields/{i}", request.form_id),
                    true,
                ));
            }
            output.with_field(format!("field_{i}"), field)
        });
        Ok(Some(EvaluationState::single(request.form_id.clone(), output)))
    }
}

/// Run the simulation
///
/// # Errors
/// If parameters are out of range or the listener channel closes early.
pub async fn run_simulator(
    config: SimulatorConfig,
    settings: &FormEvalConfig,
) -> anyhow::Result<SimulatorReport> {
    anyhow::ensure!(config.forms > 0, "forms must be greater than zero");
    anyhow::ensure!(
        (0.0..=1.0).contains(&config.failure_rate),
        "failure rate must be between 0 and 1, got {}",
        config.failure_rate
    );

    let latency = Duration::from_millis(config.latency_ms);
    let coalescer = FormEvaluationCoalescer::from_config(
        settings,
        Arc::new(BlockingEvaluator::new(simulated_compute(config.fields, latency))),
        Arc::new(SimulatedFetcher {
            latency: latency / 2,
        }),
    );
    let (listener, handle) = FormEvaluationListener::new(coalescer.clone(), 1024);
    let listener = tokio::spawn(listener.run());

    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut expected = BTreeSet::new();

    handle.start().await?;
    for revision in 0..config.requests {
        let form_id = FormId::new(format!("form-{}", rng.random_range(0..config.forms)));
        let fail = rng.random_bool(config.failure_rate);
        if !fail {
            expected.insert(form_id.clone());
        }

        let request = FormEvalRequest::new(form_id)
            .with_action_configuration(json!({ "revision": revision, "fail": fail }));
        handle.evaluate(request).await?;

        if rng.random_bool(0.25) {
            tokio::task::yield_now().await;
        }
    }
    drop(handle);

    let listener = listener.await?;
    coalescer.wait_idle().await;

    let state = coalescer.store().snapshot();
    let missing_forms = expected
        .into_iter()
        .filter(|form_id| state.get(form_id).is_none())
        .collect();

    let report = SimulatorReport {
        config,
        listener,
        stats: coalescer.stats(),
        forms_in_state: state.len(),
        missing_forms,
        ended_idle: coalescer.is_idle(),
        elapsed_ms: start.elapsed().as_millis(),
    };
    tracing::info!(
        submitted = report.stats.submitted,
        failed = report.stats.failed,
        passed = report.passed(),
        "simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulation_accounts_for_every_request() {
        let config = SimulatorConfig {
            seed: 7,
            requests: 40,
            forms: 3,
            fields: 3,
            latency_ms: 0,
            failure_rate: 0.2,
        };
        let report = run_simulator(config, &FormEvalConfig::default()).await.unwrap();

        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.submitted, 40);
        assert_eq!(report.stats.evaluated + report.stats.failed, 40);
        assert_eq!(report.listener.events_received, 41);
        assert_eq!(report.listener.drives_panicked, 0);
        assert!(report.forms_in_state <= 3);
    }

    #[tokio::test]
    async fn same_seed_same_outcome() {
        let config = SimulatorConfig {
            latency_ms: 0,
            requests: 30,
            ..SimulatorConfig::default()
        };
        let a = run_simulator(config.clone(), &FormEvalConfig::default()).await.unwrap();
        let b = run_simulator(config, &FormEvalConfig::default()).await.unwrap();

        assert_eq!(a.stats.failed, b.stats.failed);
        assert_eq!(a.forms_in_state, b.forms_in_state);
    }

    #[tokio::test]
    async fn rejects_bad_failure_rate() {
        let config = SimulatorConfig {
            failure_rate: 1.5,
            ..SimulatorConfig::default()
        };
        assert!(run_simulator(config, &FormEvalConfig::default()).await.is_err());
    }

    #[test]
    fn compute_marks_even_fields_fetchable() {
        let compute = simulated_compute(4, Duration::ZERO);
        let request = FormEvalRequest::new("form-0")
            .with_action_configuration(json!({ "revision": 1, "fail": false }));

        let state = compute(&EvaluationState::new(), &request).unwrap().unwrap();
        let output = state.get(&"form-0".into()).unwrap();
        assert_eq!(output.fetchable_keys(), vec!["field_0", "field_2"]);
    }
}
