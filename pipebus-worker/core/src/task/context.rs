//! Runtime context handed to every handler invocation.
//!
//! Carries the processor identity, the execution interval from the definition,
//! the cancellation token of the current run, and the out-of-band error channel
//! that feeds the processor's failure monitor.

use super::failure::Failure;
use crate::payload::Payload;
use crate::BoxError;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that can occur during TaskContext operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Required builder attribute was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Context of one processor run.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Numeric id of the owning processor.
    pub processor_id: u64,
    /// Name of the owning processor.
    pub processor_name: String,
    /// Optional execution interval configured for the processor.
    pub interval: Option<Duration>,
    cancel: CancellationToken,
    failures: UnboundedSender<Failure>,
}

impl TaskContext {
    /// Token cancelled when the processor stops.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the processor is stopped.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sender handlers can clone into their own background tasks.
    pub fn error_sender(&self) -> ErrorSender {
        ErrorSender {
            processor_id: self.processor_id,
            processor_name: self.processor_name.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Reports an error not tied to a particular payload.
    pub fn report_error(&self, error: impl Into<BoxError>) {
        self.fail(error.into(), None);
    }

    pub(crate) fn fail(&self, error: BoxError, payload: Option<Payload>) {
        send_failure(
            &self.failures,
            Failure {
                error,
                payload,
                processor_id: self.processor_id,
                processor_name: self.processor_name.clone(),
            },
        );
    }
}

/// Detached handle on a processor's failure channel.
#[derive(Clone, Debug)]
pub struct ErrorSender {
    processor_id: u64,
    processor_name: String,
    failures: UnboundedSender<Failure>,
}

impl ErrorSender {
    pub fn send(&self, error: impl Into<BoxError>) {
        send_failure(
            &self.failures,
            Failure {
                error: error.into(),
                payload: None,
                processor_id: self.processor_id,
                processor_name: self.processor_name.clone(),
            },
        );
    }
}

fn send_failure(failures: &UnboundedSender<Failure>, failure: Failure) {
    if let Err(e) = failures.send(failure) {
        // Monitor is gone, so the processor was dropped.
        warn!("Failure dropped: {}", e.0);
    }
}

/// Builder for constructing TaskContext instances.
#[derive(Default)]
pub struct TaskContextBuilder {
    processor_id: Option<u64>,
    processor_name: Option<String>,
    interval: Option<Duration>,
    cancel: Option<CancellationToken>,
    failures: Option<UnboundedSender<Failure>>,
}

impl TaskContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processor_id(mut self, id: u64) -> Self {
        self.processor_id = Some(id);
        self
    }

    pub fn processor_name(mut self, name: impl Into<String>) -> Self {
        self.processor_name = Some(name.into());
        self
    }

    pub fn interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn failures(mut self, failures: UnboundedSender<Failure>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Builds the TaskContext instance.
    ///
    /// # Errors
    /// Returns `Error::MissingRequiredAttribute` if required fields are not set.
    pub fn build(self) -> Result<TaskContext, Error> {
        Ok(TaskContext {
            processor_id: self
                .processor_id
                .ok_or_else(|| Error::MissingRequiredAttribute("processor_id".to_string()))?,
            processor_name: self
                .processor_name
                .ok_or_else(|| Error::MissingRequiredAttribute("processor_name".to_string()))?,
            interval: self.interval,
            cancel: self
                .cancel
                .ok_or_else(|| Error::MissingRequiredAttribute("cancellation".to_string()))?,
            failures: self
                .failures
                .ok_or_else(|| Error::MissingRequiredAttribute("failures".to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn context() -> (TaskContext, mpsc::UnboundedReceiver<Failure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TaskContextBuilder::new()
            .processor_id(3)
            .processor_name("parse")
            .cancellation(CancellationToken::new())
            .failures(tx)
            .build()
            .unwrap();
        (ctx, rx)
    }

    #[test]
    fn test_builder_missing_attribute() {
        let result = TaskContextBuilder::new().processor_id(1).build();
        assert!(matches!(
            result,
            Err(Error::MissingRequiredAttribute(attr)) if attr == "processor_name"
        ));
    }

    #[tokio::test]
    async fn test_report_error_reaches_failure_channel() {
        let (ctx, mut rx) = context();
        ctx.report_error("disk full");

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.processor_id, 3);
        assert_eq!(failure.processor_name, "parse");
        assert!(failure.payload.is_none());
        assert_eq!(failure.error.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_error_sender_outlives_context() {
        let (ctx, mut rx) = context();
        let sender = ctx.error_sender();
        drop(ctx);

        tokio::spawn(async move { sender.send("background task failed") })
            .await
            .unwrap();

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.error.to_string(), "background task failed");
    }

    #[tokio::test]
    async fn test_cancelled_completes_after_cancel() {
        let (ctx, _rx) = context();
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
