//! Engine on top of NATS core pub/sub.
//!
//! Every subscription opens a NATS subscription on the topic subject and a relay
//! task that decodes inbound messages into the subscriber's pipe. There is no
//! buffer: a payload published while nobody listens is lost.

use crate::message::{NatsMessageExt, PayloadExt};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::StreamExt;
use pipebus_core::bus::{DeliveryError, Engine, Error, Pipe};
use pipebus_core::payload::Payload;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

type SubscriptionKey = (String, String);

/// Registry entry of one relay task.
#[derive(Debug)]
struct Subscription {
    id: u64,
    token: CancellationToken,
}

type Subscriptions = DashMap<SubscriptionKey, Subscription>;

/// Distributed engine. Cloning shares the connection and the registry.
#[derive(Debug, Clone)]
pub struct NatsEngine {
    client: async_nats::Client,
    topics: Arc<DashMap<String, ()>>,
    subscriptions: Arc<Subscriptions>,
    next_subscription: Arc<AtomicU64>,
    decode_failures: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl NatsEngine {
    pub fn new(client: async_nats::Client) -> Self {
        NatsEngine {
            client,
            topics: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            next_subscription: Arc::new(AtomicU64::new(1)),
            decode_failures: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of inbound messages that could not be decoded into payloads.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Ends every relay task, closing all pipes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Removes the entry of relay `id` unless a newer subscription replaced it.
fn forget_subscription(subscriptions: &Subscriptions, key: &SubscriptionKey, id: u64) -> bool {
    subscriptions
        .remove_if(key, |_, subscription| subscription.id == id)
        .is_some()
}

/// Outcome of relaying one inbound message.
#[derive(Debug, PartialEq, Eq)]
enum Relay {
    Delivered,
    Dropped,
    Closed,
}

fn relay(
    topic: &str,
    decoded: Result<Payload, crate::message::Error>,
    tx: &mpsc::Sender<Payload>,
    decode_failures: &AtomicU64,
) -> Relay {
    let payload = match decoded {
        Ok(payload) => payload,
        Err(e) => {
            decode_failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic, "Dropping undecodable message: {}", e);
            return Relay::Dropped;
        }
    };
    match tx.try_send(payload) {
        Ok(()) => Relay::Delivered,
        Err(TrySendError::Full(_)) => {
            warn!(topic, "Subscriber queue is full, message dropped");
            Relay::Dropped
        }
        Err(TrySendError::Closed(_)) => Relay::Closed,
    }
}

#[async_trait]
impl Engine for NatsEngine {
    fn kind(&self) -> &'static str {
        "nats"
    }

    async fn create_topic(&self, topic: &str) -> Result<(), Error> {
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(_) => Err(Error::TopicExists(topic.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(());
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
        let token = self.shutdown.child_token();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let key = (topic.to_string(), subscriber_id.to_string());
        match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateSubscription {
                    topic: topic.to_string(),
                    subscriber_id: subscriber_id.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(Subscription {
                    id,
                    token: token.clone(),
                });
            }
        }
        self.topics.entry(topic.to_string()).or_insert(());

        let mut subscriber = match self.client.subscribe(topic.to_string()).await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                self.subscriptions.remove(&key);
                return Err(Error::Backend {
                    source: Box::new(e),
                });
            }
        };

        let decode_failures = Arc::clone(&self.decode_failures);
        let subscriptions = Arc::clone(&self.subscriptions);
        let topic_name = topic.to_string();
        let span = tracing::info_span!("relay", topic = %topic, subscriber = %subscriber_id);
        tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        message = subscriber.next() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    let decoded = message.to_payload();
                    if relay(&topic_name, decoded, &tx, &decode_failures) == Relay::Closed {
                        break;
                    }
                }
                if let Err(e) = subscriber.unsubscribe().await {
                    warn!("Error unsubscribing from NATS: {}", e);
                }
                // No-op after unsubscribe, which already removed the entry.
                forget_subscription(&subscriptions, &key, id);
                debug!("Relay stopped");
            }
            .instrument(span),
        );

        debug!(topic, subscriber = subscriber_id, capacity, "Subscribed");
        Ok(pipe)
    }

    async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), Error> {
        if !self.topics.contains_key(topic) {
            return Err(Error::NoSuchTopic(topic.to_string()));
        }
        let (_, subscription) = self
            .subscriptions
            .remove(&(topic.to_string(), subscriber_id.to_string()))
            .ok_or_else(|| Error::NoSuchSubscriber {
                topic: topic.to_string(),
                subscriber_id: subscriber_id.to_string(),
            })?;
        subscription.token.cancel();
        debug!(topic, subscriber = subscriber_id, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payloads: Vec<Payload>) -> Vec<DeliveryError> {
        self.topics.entry(topic.to_string()).or_insert(());
        let mut errors = Vec::new();
        for payload in payloads {
            let headers = match payload.to_headers() {
                Ok(headers) => headers,
                Err(e) => {
                    errors.push(DeliveryError::Backend {
                        topic: topic.to_string(),
                        payload,
                        source: Box::new(e),
                    });
                    continue;
                }
            };
            if let Err(e) = self
                .client
                .publish_with_headers(topic.to_string(), headers, payload.content.clone())
                .await
            {
                errors.push(DeliveryError::Backend {
                    topic: topic.to_string(),
                    payload,
                    source: Box::new(e),
                });
            }
        }
        errors
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    fn subscribers(&self, topic: &str) -> Result<Vec<String>, Error> {
        if !self.topics.contains_key(topic) {
            return Err(Error::NoSuchTopic(topic.to_string()));
        }
        let mut subscribers: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|e| e.key().0 == topic)
            .map(|e| e.key().1.clone())
            .collect();
        subscribers.sort();
        Ok(subscribers)
    }
}
