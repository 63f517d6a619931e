//! Message aggregation and delivery pipeline.
//!
//! Incoming messages are buffered per conversation, sealed into request
//! tasks by size or age, dispatched exactly once against a completion
//! backend, and kept retryable after failure within a configured budget.

pub mod aggregator;
pub mod convoy;
pub mod dispatcher;
pub mod error;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{MessageAggregator, BATCH_SEPARATOR};
pub use convoy::Convoy;
pub use dispatcher::TaskDispatcher;
pub use error::{PipelineError, Result};
pub use retry::{RetryCoordinator, RetryReport};
