//! Handler contract and output publishing.
//!
//! A [`Handler`] holds the stage logic of a processor. The processor calls
//! `handle` for every received payload (or once, with no payload, for
//! subscriptionless handlers) and hands it an [`Outputs`] to emit results with.

use super::context::TaskContext;
use crate::bus::{DeliveryError, Engine};
use crate::metrics::{MetricProvider, StageCounters};
use crate::payload::Payload;
use crate::properties::{self, Properties};
use crate::BoxError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Stage logic bound to a processor.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Registry name of the handler.
    fn name(&self) -> &str;

    /// Processes one payload, or drives the stage when `payload` is `None`.
    ///
    /// An error becomes a failure of the owning processor; it never stops the
    /// delivery loop.
    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: Option<Payload>,
        outputs: &Outputs,
    ) -> Result<(), BoxError>;

    fn configuration(&self) -> &Properties;

    fn configuration_mut(&mut self) -> &mut Properties;

    /// Checked by the processor before every start.
    fn validate_configuration(&self) -> Result<(), properties::Error> {
        self.configuration().validate()
    }

    /// Whether the handler produces payloads without subscriptions.
    fn subscriptionless(&self) -> bool {
        false
    }

    /// Gives the handler a provider for counters of its own under `prefix`.
    fn set_metric_provider(
        &self,
        _provider: Arc<dyn MetricProvider>,
        _prefix: &str,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Direct channel into the next stage of a workflow.
pub(crate) type EgressSlot = Arc<Mutex<Option<mpsc::Sender<Payload>>>>;

/// Where a processor's results go: its egress, if wired, and its output topics.
#[derive(Clone, Debug)]
pub struct Outputs {
    processor: String,
    engine: Arc<dyn Engine>,
    topics: Arc<RwLock<Vec<String>>>,
    egress: EgressSlot,
    counters: Option<StageCounters>,
}

impl Outputs {
    /// Outputs publishing to `topics` only.
    pub fn new(processor: impl Into<String>, engine: Arc<dyn Engine>, topics: Vec<String>) -> Self {
        Outputs {
            processor: processor.into(),
            engine,
            topics: Arc::new(RwLock::new(topics)),
            egress: Arc::new(Mutex::new(None)),
            counters: None,
        }
    }

    pub(crate) fn wired(
        processor: &str,
        engine: Arc<dyn Engine>,
        topics: Arc<RwLock<Vec<String>>>,
        egress: EgressSlot,
        counters: Option<StageCounters>,
    ) -> Self {
        Outputs {
            processor: processor.to_string(),
            engine,
            topics,
            egress,
            counters,
        }
    }

    /// Current output topics.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn emit(&self, payload: Payload) -> Vec<DeliveryError> {
        self.emit_all(vec![payload]).await
    }

    /// Sends payloads to the egress and publishes them to every output topic.
    ///
    /// Delivery errors are logged and returned; nothing here blocks on a full
    /// queue. Only payloads that every target accepted count as out.
    pub async fn emit_all(&self, payloads: Vec<Payload>) -> Vec<DeliveryError> {
        let topics = self.topics();
        let mut errors = Vec::new();
        let mut delivered = 0;
        for payload in payloads {
            let mut payload_errors = self.send_egress(std::slice::from_ref(&payload));
            if !topics.is_empty() {
                payload_errors.extend(self.engine.publish_topics(&topics, vec![payload]).await);
            }
            if payload_errors.is_empty() {
                delivered += 1;
            }
            errors.extend(payload_errors);
        }

        for error in &errors {
            warn!(processor = %self.processor, topic = error.topic(), "{}", error);
        }
        if let Some(counters) = &self.counters {
            if delivered > 0 {
                counters.record_out(delivered);
            }
        }
        errors
    }

    fn send_egress(&self, payloads: &[Payload]) -> Vec<DeliveryError> {
        let mut slot = self.egress.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = slot.as_ref() else {
            return Vec::new();
        };

        let mut errors = Vec::new();
        let mut closed = false;
        for payload in payloads {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(payload)) => errors.push(DeliveryError::EgressFull {
                    processor: self.processor.clone(),
                    payload,
                }),
                Err(TrySendError::Closed(payload)) => {
                    closed = true;
                    errors.push(DeliveryError::EgressClosed {
                        processor: self.processor.clone(),
                        payload,
                    });
                }
            }
        }
        if closed {
            *slot = None;
        }
        errors
    }
}
