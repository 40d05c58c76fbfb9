//! Ordering properties of the coalescer
//!
//! Requests submitted while an evaluation is in flight are processed one at
//! a time in submission order, whatever mix of failures and empty results
//! they produce, and the gate is never left held.

use formeval_core::{
    FormEvalEvent, FormEvaluationCoalescer, FormEvaluationListener, FormId, Submission,
};
use formeval_test_utils::{request, RecordingFetcher, ScriptedEvaluator};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Output,
    Empty,
    Fail,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => Just(Outcome::Output),
        1 => Just(Outcome::Empty),
        1 => Just(Outcome::Fail),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queued_requests_complete_in_submission_order(
        outcomes in prop::collection::vec(outcome(), 1..24)
    ) {
        let forms: Vec<FormId> = (0..outcomes.len())
            .map(|i| FormId::new(format!("form-{i}")))
            .collect();

        let evaluator = ScriptedEvaluator::gated();
        for (form_id, outcome) in forms.iter().zip(&outcomes) {
            match outcome {
                Outcome::Output => {}
                Outcome::Empty => {
                    evaluator.respond_empty(form_id.clone());
                }
                Outcome::Fail => {
                    evaluator.fail(form_id.clone(), "scripted failure");
                }
            }
        }
        let coalescer = FormEvaluationCoalescer::new(evaluator.clone(), RecordingFetcher::new());

        let report = runtime().block_on(async {
            assert!(!coalescer.is_in_flight());

            let leader = {
                let coalescer = coalescer.clone();
                let first = request(forms[0].as_str());
                tokio::spawn(async move { coalescer.submit(first).await })
            };
            evaluator.wait_for_calls(1).await;

            for (i, form_id) in forms.iter().enumerate().skip(1) {
                let submission = coalescer.submit(request(form_id.as_str())).await;
                assert_eq!(submission, Submission::Queued { position: i });
            }

            evaluator.release(forms.len());
            leader.await.unwrap()
        });

        let Submission::Drained(report) = report else {
            panic!("first submission should lead");
        };

        let failures = outcomes.iter().filter(|o| matches!(o, Outcome::Fail)).count();
        prop_assert_eq!(&report.processed, &forms);
        prop_assert_eq!(evaluator.calls(), forms.clone());
        prop_assert_eq!(report.failed, failures);
        prop_assert_eq!(evaluator.max_concurrent(), 1);
        prop_assert!(!coalescer.is_in_flight());
        prop_assert!(coalescer.is_idle());

        let state = coalescer.store().snapshot();
        for (form_id, outcome) in forms.iter().zip(&outcomes) {
            let stored = state.get(form_id).is_some();
            prop_assert_eq!(stored, matches!(outcome, Outcome::Output));
        }
    }

    #[test]
    fn listener_preserves_event_order(count in 1usize..16) {
        let forms: Vec<FormId> = (0..count)
            .map(|i| FormId::new(format!("form-{i}")))
            .collect();
        let evaluator = ScriptedEvaluator::gated();
        let coalescer = FormEvaluationCoalescer::new(evaluator.clone(), RecordingFetcher::new());

        let report = runtime().block_on(async {
            let (listener, handle) = FormEvaluationListener::new(coalescer.clone(), 64);
            let task = tokio::spawn(listener.run());

            handle.send(FormEvalEvent::StartEvaluation).await.unwrap();
            for form_id in &forms {
                handle.evaluate(request(form_id.as_str())).await.unwrap();
            }
            evaluator.wait_for_calls(1).await;

            tokio::time::timeout(Duration::from_secs(5), async {
                while coalescer.queue_len() < count - 1 {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .unwrap();

            evaluator.release(count);
            drop(handle);
            task.await.unwrap()
        });

        prop_assert_eq!(evaluator.calls(), forms);
        prop_assert_eq!(report.drives_spawned, 1);
        prop_assert_eq!(report.drives_panicked, 0);
        prop_assert!(coalescer.is_idle());
    }
}
