//! formeval core - single-flight form evaluation
//!
//! Serializes form evaluations against one shared state:
//! - At most one evaluation in flight, later requests queued FIFO
//! - Results merged into an [`EvaluationStore`] and broadcast
//! - A sequential dynamic-value fetch phase after the queue drains
//!
//! # Example
//!
//! ```rust,ignore
//! use formeval_core::prelude::*;
//!
//! # async fn example() {
//! let coalescer = FormEvaluationCoalescer::new(evaluator, NoopFetcher);
//! let (listener, handle) = FormEvaluationListener::new(coalescer.clone(), 64);
//! tokio::spawn(listener.run());
//!
//! handle.start().await.unwrap();
//! handle.evaluate(FormEvalRequest::init("form-1")).await.unwrap();
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod coalescer;
pub mod config;
pub mod dynamic_values;
pub mod error;
pub mod evaluator;
pub mod fetcher;
pub mod listener;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use coalescer::{Admission, CoalescerStats, DrainReport, FormEvaluationCoalescer, Lease, Submission};
pub use config::{FetchConfig, FormEvalConfig};
pub use dynamic_values::FetchReport;
pub use error::{ConfigError, EvalError, FetchError, FormEvalError};
pub use evaluator::{BlockingEvaluator, FormEvaluator};
pub use fetcher::{DynamicValueFetcher, NoopFetcher};
pub use listener::{FormEvalEvent, FormEvalHandle, FormEvaluationListener, ListenerReport};
pub use store::EvaluationStore;
pub use types::{
    ConditionalOutput, DynamicValues, DynamicValuesConfig, EvaluationState, EvaluationUpdate,
    FormEvalActionKind, FormEvalOutput, FormEvalRequest, FormId, UpdateOrigin,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with formeval
    pub use crate::{
        BlockingEvaluator, DynamicValueFetcher, EvaluationState, FormEvalConfig, FormEvalEvent,
        FormEvalRequest, FormEvaluationCoalescer, FormEvaluationListener, FormEvaluator, FormId,
        NoopFetcher, Submission,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
