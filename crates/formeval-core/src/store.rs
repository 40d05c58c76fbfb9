//! Shared evaluation state
//!
//! The store owns the [`EvaluationState`] and the broadcast channel that
//! carries every merged update to subscribers.

use crate::types::{EvaluationState, EvaluationUpdate, FormEvalOutput, FormId, UpdateOrigin};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Evaluation state plus its update stream
#[derive(Debug)]
pub struct EvaluationStore {
    state: RwLock<EvaluationState>,
    updates: broadcast::Sender<EvaluationUpdate>,
}

impl EvaluationStore {
    /// Create empty store
    ///
    /// `capacity` bounds how many updates a slow subscriber may lag behind
    /// before it starts missing them.
    #[inline]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(EvaluationState::new()),
            updates,
        }
    }

    /// Copy of the whole state
    #[must_use]
    pub fn snapshot(&self) -> EvaluationState {
        self.state.read().clone()
    }

    /// Copy of one form's output
    #[must_use]
    pub fn get(&self, form_id: &FormId) -> Option<FormEvalOutput> {
        self.state.read().get(form_id).cloned()
    }

    /// Merge `partial` and publish it
    ///
    /// Returns `false` without touching anything if `partial` is empty.
    pub fn merge(&self, partial: EvaluationState, origin: UpdateOrigin) -> bool {
        if partial.is_empty() {
            return false;
        }

        // Publish under the write lock so updates arrive in merge order.
        let mut state = self.state.write();
        state.merge(partial.clone());

        let update = EvaluationUpdate {
            origin,
            state: partial,
        };
        if self.updates.send(update).is_err() {
            tracing::trace!("evaluation update published with no subscribers");
        }
        drop(state);
        true
    }

    /// Subscribe to merged updates
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EvaluationUpdate> {
        self.updates.subscribe()
    }

    /// Number of forms with output
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Whether no form has output
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }
}

impl Default for EvaluationStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_UPDATE_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConditionalOutput;

    #[tokio::test]
    async fn merge_publishes_partial_state() {
        let store = EvaluationStore::new(8);
        let mut updates = store.subscribe();

        let partial = EvaluationState::single(
            "form-1".into(),
            FormEvalOutput::new().with_field("name", ConditionalOutput::visible()),
        );
        assert!(store.merge(partial.clone(), UpdateOrigin::Evaluation));

        let update = updates.recv().await.unwrap();
        assert_eq!(update.origin, UpdateOrigin::Evaluation);
        assert_eq!(update.state, partial);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_merge_is_ignored() {
        let store = EvaluationStore::new(8);
        let mut updates = store.subscribe();

        assert!(!store.merge(EvaluationState::new(), UpdateOrigin::Evaluation));
        assert!(store.is_empty());
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn merge_without_subscribers_still_updates() {
        let store = EvaluationStore::new(1);
        store.merge(
            EvaluationState::single("a".into(), FormEvalOutput::new()),
            UpdateOrigin::DynamicValues,
        );
        assert!(store.get(&"a".into()).is_some());
    }

    #[test]
    fn concurrent_merges_publish_in_merge_order() {
        let store = std::sync::Arc::new(EvaluationStore::new(1024));
        let mut updates = store.subscribe();

        let writers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|side| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let output = FormEvalOutput::new()
                            .with_field(format!("{side}-{i}"), ConditionalOutput::visible());
                        store.merge(
                            EvaluationState::single("shared".into(), output),
                            UpdateOrigin::Evaluation,
                        );
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut last = None;
        while let Ok(update) = updates.try_recv() {
            last = Some(update.state);
        }
        assert_eq!(last, Some(store.snapshot()));
    }
}
