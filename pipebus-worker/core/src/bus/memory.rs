//! In-process engine backed by bounded tokio channels.
//!
//! Topics live in a sharded `DashMap` so unrelated topics never contend on the
//! same lock. Each topic keeps its subscriber senders and a bounded buffer that
//! collects payloads published while nobody is subscribed. A periodic drain cycle
//! moves buffered payloads to subscribers once they appear.

use super::{DeliveryError, Engine, Error, Pipe};
use crate::payload::Payload;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

/// Default number of payloads a topic buffers while it has no subscribers.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default period of the drain cycle.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(100);
/// Shortest period the drain cycle runs with.
pub const MIN_DRAIN_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_TOPIC_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Subscriber {
    id: String,
    tx: mpsc::Sender<Payload>,
}

/// Named mailbox: subscriber senders plus the no-subscriber buffer.
///
/// Lock order is always `subscribers` then `buffer`.
#[derive(Debug)]
struct Topic {
    id: u64,
    key: String,
    subscribers: RwLock<Vec<Subscriber>>,
    buffer: Mutex<VecDeque<Payload>>,
    buffer_capacity: usize,
}

impl Topic {
    fn new(key: &str, buffer_capacity: usize) -> Self {
        Topic {
            id: NEXT_TOPIC_ID.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            subscribers: RwLock::new(Vec::new()),
            buffer: Mutex::new(VecDeque::new()),
            buffer_capacity,
        }
    }

    fn publish(&self, payload: Payload, errors: &mut Vec<DeliveryError>) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        if subscribers.is_empty() {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.len() >= self.buffer_capacity {
                errors.push(DeliveryError::BufferFull {
                    topic: self.key.clone(),
                    payload,
                });
            } else {
                buffer.push_back(payload);
            }
            return;
        }

        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(payload)) => {
                    errors.push(DeliveryError::SubscriberQueueFull {
                        topic: self.key.clone(),
                        subscriber_id: subscriber.id.clone(),
                        payload,
                    });
                }
                Err(TrySendError::Closed(payload)) => {
                    errors.push(DeliveryError::SubscriberClosed {
                        topic: self.key.clone(),
                        subscriber_id: subscriber.id.clone(),
                        payload,
                    });
                }
            }
        }
    }

    /// Moves buffered payloads to the current subscribers, oldest first.
    ///
    /// A payload leaves the buffer once at least one subscriber accepted it. When
    /// every subscriber is full the payload stays at the head and draining stops.
    fn drain(&self) -> usize {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.is_empty() {
            return 0;
        }

        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        while let Some(payload) = buffer.front() {
            let mut accepted = false;
            for subscriber in subscribers.iter() {
                if subscriber.tx.try_send(payload.clone()).is_ok() {
                    accepted = true;
                }
            }
            if !accepted {
                break;
            }
            buffer.pop_front();
            delivered += 1;
        }
        delivered
    }

    fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }
}

/// In-process engine. Cloning shares the same topic registry.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    topics: Arc<DashMap<String, Arc<Topic>>>,
    buffer_size: usize,
    drain_interval: Duration,
    shutdown: CancellationToken,
}

impl MemoryEngine {
    /// Returns the topic for `key`, creating it on first use.
    fn topic(&self, key: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.get(key) {
            return Arc::clone(topic.value());
        }
        let topic = self
            .topics
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Topic::new(key, self.buffer_size)));
        Arc::clone(topic.value())
    }

    fn existing_topic(&self, key: &str) -> Result<Arc<Topic>, Error> {
        self.topics
            .get(key)
            .map(|topic| Arc::clone(topic.value()))
            .ok_or_else(|| Error::NoSuchTopic(key.to_string()))
    }

    /// Runs one drain cycle over every topic.
    ///
    /// Returns the number of buffered payloads handed to subscribers.
    pub fn drain(&self) -> usize {
        let topics: Vec<Arc<Topic>> = self
            .topics
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for topic in topics {
            let moved = topic.drain();
            if moved > 0 {
                debug!(topic = %topic.key, moved, "Drained buffered payloads");
            }
            delivered += moved;
        }
        delivered
    }

    /// Spawns the periodic drain cycle. It runs until [`MemoryEngine::shutdown`].
    pub fn spawn_drain(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                let mut interval =
                    tokio::time::interval(engine.drain_interval.max(MIN_DRAIN_INTERVAL));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => {
                            debug!("Drain cycle stopped");
                            break;
                        }
                        _ = interval.tick() => {
                            engine.drain();
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Stops the drain cycle.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of payloads waiting in the buffer of `topic`.
    pub fn buffered(&self, topic: &str) -> Result<usize, Error> {
        Ok(self.existing_topic(topic)?.buffered())
    }

    /// Numeric id assigned to `topic` when it was created.
    pub fn topic_id(&self, topic: &str) -> Option<u64> {
        self.topics.get(topic).map(|topic| topic.id)
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create_topic(&self, topic: &str) -> Result<(), Error> {
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(_) => Err(Error::TopicExists(topic.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Topic::new(topic, self.buffer_size)));
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber_id: &str,
        capacity: usize,
    ) -> Result<Pipe, Error> {
        let (tx, pipe) = Pipe::channel(topic, subscriber_id, capacity)?;
        let topic = self.topic(topic);

        let mut subscribers = topic
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.iter().any(|s| s.id == subscriber_id) {
            return Err(Error::DuplicateSubscription {
                topic: topic.key.clone(),
                subscriber_id: subscriber_id.to_string(),
            });
        }
        subscribers.push(Subscriber {
            id: subscriber_id.to_string(),
            tx,
        });

        debug!(topic = %topic.key, subscriber = subscriber_id, capacity, "Subscribed");
        Ok(pipe)
    }

    async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), Error> {
        let topic = self.existing_topic(topic)?;
        let mut subscribers = topic
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let position = subscribers
            .iter()
            .position(|s| s.id == subscriber_id)
            .ok_or_else(|| Error::NoSuchSubscriber {
                topic: topic.key.clone(),
                subscriber_id: subscriber_id.to_string(),
            })?;

        // Dropping the sender closes the pipe once its queue is empty.
        subscribers.remove(position);
        debug!(topic = %topic.key, subscriber = subscriber_id, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payloads: Vec<Payload>) -> Vec<DeliveryError> {
        let topic = self.topic(topic);
        let mut errors = Vec::new();
        for payload in payloads {
            topic.publish(payload, &mut errors);
        }
        errors
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    fn subscribers(&self, topic: &str) -> Result<Vec<String>, Error> {
        Ok(self.existing_topic(topic)?.subscriber_ids())
    }
}

/// Builder for the in-process engine.
#[derive(Default)]
pub struct MemoryEngineBuilder {
    buffer_size: Option<usize>,
    drain_interval: Option<Duration>,
}

impl MemoryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of the buffer every topic gets at creation.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Period of the background drain cycle. Raised to [`MIN_DRAIN_INTERVAL`]
    /// when shorter.
    pub fn drain_interval(mut self, drain_interval: Duration) -> Self {
        self.drain_interval = Some(drain_interval);
        self
    }

    pub fn build(self) -> MemoryEngine {
        MemoryEngine {
            topics: Arc::new(DashMap::new()),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            drain_interval: self.drain_interval.unwrap_or(DEFAULT_DRAIN_INTERVAL),
            shutdown: CancellationToken::new(),
        }
    }
}
