//! Failure records raised by running processors.
//!
//! Anything a handler returns as an error, or reports out of band through its
//! context, becomes a [`Failure`] and goes to the processor's failure handler.
//! Failures never travel back to the publisher.

use crate::payload::Payload;
use crate::BoxError;
use std::sync::Arc;
use tracing::error;

/// Runtime error attributed to a processor.
#[derive(Debug)]
pub struct Failure {
    /// Error returned or reported by the handler.
    pub error: BoxError,
    /// Payload being processed when the error happened, if any.
    pub payload: Option<Payload>,
    pub processor_id: u64,
    pub processor_name: String,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processor {} ({}) failed: {}",
            self.processor_name, self.processor_id, self.error
        )
    }
}

/// Sink invoked synchronously for every failure of a processor.
pub type FailureHandler = Arc<dyn Fn(Failure) + Send + Sync>;

/// Failure handler that logs every failure at error level.
pub fn log_failures() -> FailureHandler {
    Arc::new(|failure: Failure| {
        let source = failure.payload.as_ref().map(|p| p.source.as_str());
        error!(
            processor = %failure.processor_name,
            processor_id = failure.processor_id,
            payload_source = source,
            "{}",
            failure.error
        );
    })
}
