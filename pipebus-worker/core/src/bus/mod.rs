//! Topic-based publish/subscribe bus.
//!
//! The [`Engine`] trait is the broker abstraction every processor talks to. Delivery
//! is non-blocking: a full queue never stalls the publisher or other subscribers,
//! it is reported back as a [`DeliveryError`] for the caller to retry, drop or log.

pub mod memory;

use crate::payload::Payload;
use crate::BoxError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors returned by topology operations on an engine.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The (topic, subscriber) pair is already registered.
    #[error("Subscriber '{subscriber_id}' is already subscribed to topic '{topic}'")]
    DuplicateSubscription { topic: String, subscriber_id: String },
    /// Topic was never created.
    #[error("Topic '{}' does not exist", _0)]
    NoSuchTopic(String),
    /// Topic exists but the subscriber is not registered on it.
    #[error("Subscriber '{subscriber_id}' is not subscribed to topic '{topic}'")]
    NoSuchSubscriber { topic: String, subscriber_id: String },
    /// Explicit topic creation collided with an existing topic.
    #[error("Topic '{}' already exists", _0)]
    TopicExists(String),
    /// Queues need room for at least one payload.
    #[error("Queue capacity must be greater than zero")]
    InvalidCapacity,
    /// Failure reported by an out-of-process backend.
    #[error("Engine backend error: {source}")]
    Backend {
        #[source]
        source: BoxError,
    },
}

/// Pseudo topic reported for failures on direct processor-to-processor wiring.
pub const EGRESS_TOPIC: &str = "egress";

/// Per-payload delivery failure returned from publish.
///
/// Every variant hands the rejected payload back so the caller owns the retry
/// or drop decision.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DeliveryError {
    /// Topic has no subscribers and its buffer is full.
    #[error("Buffer of topic '{topic}' is full, payload dropped")]
    BufferFull { topic: String, payload: Payload },
    /// A subscriber pipe is full.
    #[error("Queue of subscriber '{subscriber_id}' on topic '{topic}' is full")]
    SubscriberQueueFull {
        topic: String,
        subscriber_id: String,
        payload: Payload,
    },
    /// The receiving end of a subscriber pipe was dropped.
    #[error("Subscriber '{subscriber_id}' on topic '{topic}' is closed")]
    SubscriberClosed {
        topic: String,
        subscriber_id: String,
        payload: Payload,
    },
    /// The next stage's ingress queue is full.
    #[error("Egress queue of processor '{processor}' is full")]
    EgressFull { processor: String, payload: Payload },
    /// The next stage dropped its ingress.
    #[error("Egress of processor '{processor}' is closed")]
    EgressClosed { processor: String, payload: Payload },
    /// The backend refused or failed to accept the payload.
    #[error("Error handing payload to backend for topic '{topic}': {source}")]
    Backend {
        topic: String,
        payload: Payload,
        #[source]
        source: BoxError,
    },
}

impl DeliveryError {
    /// Topic the failed delivery was addressed to.
    pub fn topic(&self) -> &str {
        match self {
            DeliveryError::BufferFull { topic, .. }
            | DeliveryError::SubscriberQueueFull { topic, .. }
            | DeliveryError::SubscriberClosed { topic, .. }
            | DeliveryError::Backend { topic, .. } => topic,
            DeliveryError::EgressFull { .. } | DeliveryError::EgressClosed { .. } => EGRESS_TOPIC,
        }
    }

    /// Payload that was not delivered.
    pub fn payload(&self) -> &Payload {
        match self {
            DeliveryError::BufferFull { payload, .. }
            | DeliveryError::SubscriberQueueFull { payload, .. }
            | DeliveryError::SubscriberClosed { payload, .. }
            | DeliveryError::EgressFull { payload, .. }
            | DeliveryError::EgressClosed { payload, .. }
            | DeliveryError::Backend { payload, .. } => payload,
        }
    }

    /// Takes back ownership of the payload, e.g. to retry it.
    pub fn into_payload(self) -> Payload {
        match self {
            DeliveryError::BufferFull { payload, .. }
            | DeliveryError::SubscriberQueueFull { payload, .. }
            | DeliveryError::SubscriberClosed { payload, .. }
            | DeliveryError::EgressFull { payload, .. }
            | DeliveryError::EgressClosed { payload, .. }
            | DeliveryError::Backend { payload, .. } => payload,
        }
    }
}

/// Bounded, ordered delivery queue bound to one (topic, subscriber) pair.
///
/// The pipe is the receiving end; the engine keeps the sending end. Once the
/// subscriber is unsubscribed the pipe yields its remaining payloads and then
/// `None`.
#[derive(Debug)]
pub struct Pipe {
    topic: String,
    subscriber_id: String,
    rx: mpsc::Receiver<Payload>,
}

impl Pipe {
    /// Creates a pipe and the sender an engine delivers through.
    ///
    /// # Errors
    /// Returns `Error::InvalidCapacity` when `capacity` is zero.
    pub fn channel(
        topic: &str,
        subscriber_id: &str,
        capacity: usize,
    ) -> Result<(mpsc::Sender<Payload>, Pipe), Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((
            tx,
            Pipe {
                topic: topic.to_string(),
                subscriber_id: subscriber_id.to_string(),
                rx,
            },
        ))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Waits for the next payload. Returns `None` once the pipe is closed and empty.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Takes the next payload without waiting.
    pub fn try_recv(&mut self) -> Result<Payload, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Number of payloads waiting in the pipe.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Publish/subscribe broker abstraction.
///
/// Implementations must tolerate concurrent calls from any number of processors
/// without external locking.
#[async_trait]
pub trait Engine: std::fmt::Debug + Send + Sync + 'static {
    /// Short name of the backend, used in logs.
    fn kind(&self) -> &'static str;

    /// Creates a topic explicitly.
    ///
    /// # Errors
    /// Returns `Error::TopicExists` if the topic is already known. Publish and
    /// subscribe create topics implicitly and never report a collision.
    async fn create_topic(&self, topic: &str) -> Result<(), Error>;

    /// Registers `subscriber_id` on `topic` and returns its pipe.
    ///
    /// # Errors
    /// Returns `Error::DuplicateSubscription` if the pair is already registered.
    async fn subscribe(
        &self,
        topic: &str,
        subscriber_id: &str,
        capacity: usize,
    ) -> Result<Pipe, Error>;

    /// Removes a subscriber and closes its pipe.
    async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), Error>;

    /// Delivers payloads to every subscriber of `topic` without blocking.
    ///
    /// Returns one error per rejected (subscriber, payload) pair.
    async fn publish(&self, topic: &str, payloads: Vec<Payload>) -> Vec<DeliveryError>;

    /// Publishes the same payloads to several topics, concatenating the errors.
    async fn publish_topics(&self, topics: &[String], payloads: Vec<Payload>) -> Vec<DeliveryError> {
        let mut errors = Vec::new();
        for topic in topics {
            errors.extend(self.publish(topic, payloads.clone()).await);
        }
        errors
    }

    /// Names of all known topics, sorted.
    fn topics(&self) -> Vec<String>;

    /// Subscriber identities registered on a topic.
    fn subscribers(&self, topic: &str) -> Result<Vec<String>, Error>;
}
