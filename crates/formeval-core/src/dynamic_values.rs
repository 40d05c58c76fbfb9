//! Dynamic value fetch phase
//!
//! Runs after the last queued evaluation completes. Fields whose fetch
//! instructions allow it are fetched one after another, in mapping order,
//! and the updated output is returned for a single merged publish.

use crate::coalescer::StatsCounters;
use crate::fetcher::DynamicValueFetcher;
use crate::types::{FormEvalOutput, FormId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one fetch phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    /// Form the phase ran for
    pub form_id: Option<FormId>,
    /// Field keys fetched, in order
    pub attempted: Vec<String>,
    /// Fields whose data was stored
    pub succeeded: usize,
    /// Fields whose fetch failed
    pub failed: usize,
    /// Fields that got an empty response
    pub empty: usize,
}

/// Fetch every allowed field of `output` sequentially
///
/// Never fails: fetch errors are logged and the field is left as it was
/// after `has_started` was set.
pub(crate) async fn fetch_dynamic_values(
    fetcher: &dyn DynamicValueFetcher,
    form_id: &FormId,
    mut output: FormEvalOutput,
    stats: &StatsCounters,
) -> (FormEvalOutput, FetchReport) {
    let mut report = FetchReport {
        form_id: Some(form_id.clone()),
        ..FetchReport::default()
    };

    for key in output.fetchable_keys() {
        let Some(values) = output
            .get_mut(&key)
            .and_then(|field| field.fetch_dynamic_values.as_mut())
        else {
            continue;
        };

        values.has_started = true;
        let url = values.url().to_string();
        report.attempted.push(key.clone());
        stats.record_fetch_started();

        tracing::debug!(form_id = %form_id, field = %key, url = %url, "fetching dynamic values");

        match fetcher.fetch(&url).await {
            Ok(Some(data)) if has_data(&data) => {
                values.is_loading = false;
                values.data = Some(data);
                report.succeeded += 1;
                stats.record_fetch_succeeded();
            }
            Ok(_) => {
                tracing::debug!(form_id = %form_id, field = %key, "empty dynamic values response");
                report.empty += 1;
                stats.record_fetch_empty();
            }
            Err(e) => {
                tracing::error!(form_id = %form_id, field = %key, error = %e, "dynamic values fetch failed");
                report.failed += 1;
                stats.record_fetch_failed();
            }
        }
    }

    (output, report)
}

/// `null`, `false`, `0` and `""` carry no values
fn has_data(data: &Value) -> bool {
    match data {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
