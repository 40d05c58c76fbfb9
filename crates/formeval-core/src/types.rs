//! Core types for form evaluation
//!
//! Defines the data that flows through the coalescer:
//! - Form identifiers and evaluation requests
//! - Per-field conditional output and fetch instructions
//! - The shared evaluation state and the updates published for it

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque form identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(pub String);

impl FormId {
    /// Create form ID from any string-like value
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FormId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FormId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which trigger produced an evaluation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormEvalActionKind {
    /// Form was opened and needs its first evaluation
    Init,
    /// Form configuration changed
    #[default]
    Run,
}

/// A pending evaluation request
///
/// Carries the form to evaluate plus whatever configuration the evaluator
/// needs. The coalescer never inspects anything but `form_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormEvalRequest {
    /// Trigger kind
    #[serde(default)]
    pub kind: FormEvalActionKind,
    /// Form being evaluated
    pub form_id: FormId,
    /// Current action configuration of the form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_configuration: Option<Value>,
    /// Editor section form-control configs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_config: Option<Vec<Value>>,
    /// Settings section form-control configs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting_config: Option<Vec<Value>>,
}

impl FormEvalRequest {
    /// Create a `Run` request with no configuration
    #[inline]
    #[must_use]
    pub fn new(form_id: impl Into<FormId>) -> Self {
        Self {
            kind: FormEvalActionKind::Run,
            form_id: form_id.into(),
            action_configuration: None,
            editor_config: None,
            setting_config: None,
        }
    }

    /// Create an `Init` request
    #[inline]
    #[must_use]
    pub fn init(form_id: impl Into<FormId>) -> Self {
        Self::new(form_id).with_kind(FormEvalActionKind::Init)
    }

    /// With trigger kind
    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: FormEvalActionKind) -> Self {
        self.kind = kind;
        self
    }

    /// With action configuration
    #[inline]
    #[must_use]
    pub fn with_action_configuration(mut self, config: Value) -> Self {
        self.action_configuration = Some(config);
        self
    }

    /// With editor config
    #[inline]
    #[must_use]
    pub fn with_editor_config(mut self, config: Vec<Value>) -> Self {
        self.editor_config = Some(config);
        self
    }

    /// With setting config
    #[inline]
    #[must_use]
    pub fn with_setting_config(mut self, config: Vec<Value>) -> Self {
        self.setting_config = Some(config);
        self
    }
}

/// Where a dynamic value is fetched from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DynamicValuesConfig {
    /// Absolute URL or a path relative to the fetcher's base URL
    pub url: String,
}

/// Fetch instructions attached to a field
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicValues {
    /// Whether the fetch phase may retrieve this field
    #[serde(default)]
    pub allowed_to_fetch: bool,
    /// Set once the fetch phase has issued the request
    #[serde(default)]
    pub has_started: bool,
    /// Cleared when a non-empty response arrives
    #[serde(default)]
    pub is_loading: bool,
    /// Resolved response data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Request configuration
    pub config: DynamicValuesConfig,
}

impl DynamicValues {
    /// Fetch instructions for `url`, loading and not yet started
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>, allowed_to_fetch: bool) -> Self {
        Self {
            allowed_to_fetch,
            has_started: false,
            is_loading: true,
            data: None,
            config: DynamicValuesConfig { url: url.into() },
        }
    }

    /// URL to fetch
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

/// Computed result for a single field
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalOutput {
    /// Field visibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    /// Field enablement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Instructions for dynamically-sourced values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_dynamic_values: Option<DynamicValues>,
}

impl ConditionalOutput {
    /// Visible, enabled field without fetch instructions
    #[inline]
    #[must_use]
    pub fn visible() -> Self {
        Self {
            visible: Some(true),
            enabled: Some(true),
            fetch_dynamic_values: None,
        }
    }

    /// With fetch instructions
    #[inline]
    #[must_use]
    pub fn with_dynamic_values(mut self, values: DynamicValues) -> Self {
        self.fetch_dynamic_values = Some(values);
        self
    }

    /// Fetch instructions, if the field may be fetched
    #[inline]
    #[must_use]
    pub fn fetchable(&self) -> Option<&DynamicValues> {
        self.fetch_dynamic_values
            .as_ref()
            .filter(|values| values.allowed_to_fetch)
    }
}

/// Computed output of one form, keyed by field in evaluation order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormEvalOutput(pub IndexMap<String, ConditionalOutput>);

impl FormEvalOutput {
    /// Empty output
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a field appended
    #[inline]
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, output: ConditionalOutput) -> Self {
        self.0.insert(key.into(), output);
        self
    }

    /// Look up a field
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConditionalOutput> {
        self.0.get(key)
    }

    /// Mutable field lookup
    #[inline]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ConditionalOutput> {
        self.0.get_mut(key)
    }

    /// Keys of fields marked allowed-to-fetch, in mapping order
    #[must_use]
    pub fn fetchable_keys(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, output)| output.fetchable().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Form ID to computed output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationState(pub IndexMap<FormId, FormEvalOutput>);

impl EvaluationState {
    /// Empty state
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State holding a single form's output
    #[inline]
    #[must_use]
    pub fn single(form_id: FormId, output: FormEvalOutput) -> Self {
        Self::new().with_form(form_id, output)
    }

    /// With a form's output set
    #[inline]
    #[must_use]
    pub fn with_form(mut self, form_id: FormId, output: FormEvalOutput) -> Self {
        self.0.insert(form_id, output);
        self
    }

    /// Output of a form
    #[inline]
    #[must_use]
    pub fn get(&self, form_id: &FormId) -> Option<&FormEvalOutput> {
        self.0.get(form_id)
    }

    /// Remove and return a form's output
    #[inline]
    pub fn take(&mut self, form_id: &FormId) -> Option<FormEvalOutput> {
        self.0.shift_remove(form_id)
    }

    /// Replace each form present in `partial`, keeping the others
    pub fn merge(&mut self, partial: EvaluationState) {
        for (form_id, output) in partial.0 {
            self.0.insert(form_id, output);
        }
    }

    /// Form IDs in insertion order
    pub fn form_ids(&self) -> impl Iterator<Item = &FormId> {
        self.0.keys()
    }

    /// Number of forms
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no form has output
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Which phase produced an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Evaluator result
    Evaluation,
    /// Fetch phase result
    DynamicValues,
}

/// Outbound state-update event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationUpdate {
    /// Producing phase
    pub origin: UpdateOrigin,
    /// The partial state that was merged
    pub state: EvaluationState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_dynamic_values_are_inert() {
        let values = DynamicValues::default();
        assert!(!values.allowed_to_fetch);
        assert!(!values.has_started);
        assert!(!values.is_loading);
        assert!(values.url().is_empty());

        let field = ConditionalOutput::visible().with_dynamic_values(values);
        assert!(field.fetchable().is_none());
    }

    #[test]
    fn fetchable_keys_keep_mapping_order() {
        let output = FormEvalOutput::new()
            .with_field(
                "zeta",
                ConditionalOutput::visible().with_dynamic_values(DynamicValues::new("/z", true)),
            )
            .with_field("plain", ConditionalOutput::visible())
            .with_field(
                "blocked",
                ConditionalOutput::visible().with_dynamic_values(DynamicValues::new("/b", false)),
            )
            .with_field(
                "alpha",
                ConditionalOutput::visible().with_dynamic_values(DynamicValues::new("/a", true)),
            );

        assert_eq!(output.fetchable_keys(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn merge_replaces_per_form() {
        let mut state = EvaluationState::new()
            .with_form("a".into(), FormEvalOutput::new().with_field("x", ConditionalOutput::visible()))
            .with_form("b".into(), FormEvalOutput::new());

        state.merge(EvaluationState::single(
            "a".into(),
            FormEvalOutput::new().with_field("y", ConditionalOutput::default()),
        ));

        assert_eq!(state.len(), 2);
        let a = state.get(&"a".into()).unwrap();
        assert!(a.get("x").is_none());
        assert!(a.get("y").is_some());
    }

    #[test]
    fn dynamic_values_wire_format_is_camel_case() {
        let field = ConditionalOutput::visible()
            .with_dynamic_values(DynamicValues::new("/v1/plugins/values", true));
        let value = serde_json::to_value(&field).unwrap();

        assert_eq!(
            value,
            json!({
                "visible": true,
                "enabled": true,
                "fetchDynamicValues": {
                    "allowedToFetch": true,
                    "hasStarted": false,
                    "isLoading": true,
                    "config": { "url": "/v1/plugins/values" }
                }
            })
        );
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: FormEvalRequest =
            serde_json::from_value(json!({ "formId": "form-1" })).unwrap();

        assert_eq!(request.form_id, FormId::new("form-1"));
        assert_eq!(request.kind, FormEvalActionKind::Run);
        assert!(request.action_configuration.is_none());
    }
}
