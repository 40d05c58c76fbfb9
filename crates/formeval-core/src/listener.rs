//! Event listener
//!
//! Feeds trigger events into a [`FormEvaluationCoalescer`]. Nothing is
//! evaluated until a `StartEvaluation` event arrives; afterwards every
//! `Evaluate` event is admitted in arrival order and leaders are driven on
//! their own tasks.

use crate::coalescer::{Admission, FormEvaluationCoalescer};
use crate::error::FormEvalError;
use crate::types::FormEvalRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Inbound trigger events
#[derive(Debug, Clone, PartialEq)]
pub enum FormEvalEvent {
    /// Initial state is ready; start accepting evaluations
    StartEvaluation,
    /// Evaluate a form
    Evaluate(FormEvalRequest),
}

/// Sender side of a listener
#[derive(Debug, Clone)]
pub struct FormEvalHandle {
    sender: mpsc::Sender<FormEvalEvent>,
}

impl FormEvalHandle {
    /// Send an event
    ///
    /// # Errors
    /// `FormEvalError::ChannelClosed` if the listener has stopped.
    pub async fn send(&self, event: FormEvalEvent) -> Result<(), FormEvalError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| FormEvalError::ChannelClosed)
    }

    /// Signal that evaluation may start
    ///
    /// # Errors
    /// `FormEvalError::ChannelClosed` if the listener has stopped.
    pub async fn start(&self) -> Result<(), FormEvalError> {
        self.send(FormEvalEvent::StartEvaluation).await
    }

    /// Request evaluation of a form
    ///
    /// # Errors
    /// `FormEvalError::ChannelClosed` if the listener has stopped.
    pub async fn evaluate(&self, request: FormEvalRequest) -> Result<(), FormEvalError> {
        self.send(FormEvalEvent::Evaluate(request)).await
    }
}

/// What a listener did before its channel closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerReport {
    /// Events received
    pub events_received: u64,
    /// Events dropped because evaluation had not started
    pub ignored_before_start: u64,
    /// Drive tasks spawned for leaders
    pub drives_spawned: u64,
    /// Drive tasks that panicked
    pub drives_panicked: u64,
}

/// Routes trigger events to a coalescer
#[derive(Debug)]
pub struct FormEvaluationListener {
    coalescer: FormEvaluationCoalescer,
    receiver: mpsc::Receiver<FormEvalEvent>,
}

impl FormEvaluationListener {
    /// Create listener and its handle
    #[must_use]
    pub fn new(coalescer: FormEvaluationCoalescer, buffer: usize) -> (Self, FormEvalHandle) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            Self {
                coalescer,
                receiver,
            },
            FormEvalHandle { sender },
        )
    }

    /// Process events until every handle is dropped
    ///
    /// Outstanding drive tasks are awaited before returning.
    pub async fn run(mut self) -> ListenerReport {
        let mut report = ListenerReport::default();
        let mut drives = JoinSet::new();
        let mut started = false;

        loop {
            tokio::select! {
                event = self.receiver.recv() => {
                    let Some(event) = event else { break };
                    report.events_received += 1;

                    match event {
                        FormEvalEvent::StartEvaluation => {
                            if !started {
                                tracing::info!("form evaluation started");
                            }
                            started = true;
                        }
                        FormEvalEvent::Evaluate(request) if !started => {
                            tracing::debug!(form_id = %request.form_id, "evaluation not started, ignoring request");
                            report.ignored_before_start += 1;
                        }
                        FormEvalEvent::Evaluate(request) => {
                            if let Admission::Leader(lease) = self.coalescer.admit(request) {
                                report.drives_spawned += 1;
                                drives.spawn(lease.drive());
                            }
                        }
                    }
                }
                Some(joined) = drives.join_next(), if !drives.is_empty() => {
                    record_join(joined, &mut report);
                }
            }
        }

        while let Some(joined) = drives.join_next().await {
            record_join(joined, &mut report);
        }

        tracing::info!(
            events = report.events_received,
            drives = report.drives_spawned,
            "form evaluation listener stopped"
        );
        report
    }
}

fn record_join<T>(joined: Result<T, tokio::task::JoinError>, report: &mut ListenerReport) {
    if let Err(e) = joined {
        if e.is_panic() {
            report.drives_panicked += 1;
            tracing::error!(error = %e, "form evaluation task panicked");
        } else {
            tracing::warn!(error = %e, "form evaluation task cancelled");
        }
    }
}
