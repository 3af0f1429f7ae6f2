//! Processor lifecycle and subscription wiring.
//!
//! A processor binds one [`Handler`] to its inputs (topic subscriptions and an
//! optional ingress from the previous workflow stage) and its outputs (topics
//! and an optional egress into the next stage). Starting spawns one delivery
//! task per input, or a single self-driving task for subscriptionless handlers,
//! plus a monitor that hands every failure to the failure handler.
//!
//! Stopping only signals cancellation. Use [`Processor::wait`] to join the
//! spawned tasks.

use super::context::{self, TaskContext, TaskContextBuilder};
use super::failure::{log_failures, Failure, FailureHandler};
use super::handler::{EgressSlot, Handler, Outputs};
use crate::bus::{self, Engine, Pipe, EGRESS_TOPIC};
use crate::metrics::{MetricProvider, StageCounters};
use crate::properties;
use crate::BoxError;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

/// Default capacity of subscription and egress queues.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned by processor lifecycle and wiring calls.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Processor '{}' has no handler", _0)]
    NoHandler(String),
    #[error("Configuration of processor '{processor}' is invalid: {source}")]
    ConfigInvalid {
        processor: String,
        #[source]
        source: properties::Error,
    },
    #[error("Processor '{}' needs a subscription or an ingress to start", _0)]
    IngressRequired(String),
    #[error("Processor '{}' is already stopped", _0)]
    AlreadyStopped(String),
    #[error("Processor '{processor}' already uses topic '{topic}'")]
    DuplicateTopic { processor: String, topic: String },
    #[error("Processor '{processor}' is not subscribed to topic '{topic}'")]
    NoSuchTopic { processor: String, topic: String },
    #[error("Processor '{}' is running", _0)]
    Running(String),
    #[error("Error setting metric provider on processor '{processor}': {source}")]
    MetricProvider {
        processor: String,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Bus(#[from] bus::Error),
    #[error(transparent)]
    TaskContext(#[from] context::Error),
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Stopped,
}

type SharedPipe = Arc<Mutex<Pipe>>;

/// Everything the tasks of one run share.
struct Run {
    token: CancellationToken,
    /// Delivery and self-driving tasks, closed from the start.
    tracker: TaskTracker,
    handler: Arc<dyn Handler>,
    ctx: TaskContext,
    outputs: Outputs,
}

/// Execution unit binding a handler to its inputs and outputs.
pub struct Processor {
    id: u64,
    name: String,
    engine: Arc<dyn Engine>,
    handler: Option<Arc<dyn Handler>>,
    state: State,
    queue_size: usize,
    interval: Option<Duration>,
    outputs: Arc<RwLock<Vec<String>>>,
    subscriptions: BTreeMap<String, SharedPipe>,
    ingress: Option<SharedPipe>,
    egress: EgressSlot,
    failure_handler: FailureHandler,
    counters: Option<StageCounters>,
    run: Option<Run>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("handler", &self.handler_name())
            .field("subscriptions", &self.subscriptions.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs())
            .field("ingress", &self.ingress.is_some())
            .finish()
    }
}

impl Processor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Identity used for every engine subscription of this processor.
    pub fn subscriber_id(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }

    pub fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    pub fn handler_name(&self) -> Option<&str> {
        self.handler.as_ref().map(|h| h.name())
    }

    /// Whether the handler runs without inputs.
    pub fn is_subscriptionless(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.subscriptionless())
    }

    /// Subscribed topics, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Output topics in insertion order.
    pub fn outputs(&self) -> Vec<String> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_ingress(&self) -> bool {
        self.ingress.is_some()
    }

    /// Replaces the handler.
    ///
    /// # Errors
    /// Returns `Error::Running` while the processor runs.
    pub fn set_handler(&mut self, handler: Box<dyn Handler>) -> Result<(), Error> {
        self.ensure_idle()?;
        let handler: Arc<dyn Handler> = Arc::from(handler);
        if let Some(counters) = &self.counters {
            self.forward_metric_provider(&handler, counters.provider())?;
        }
        self.handler = Some(handler);
        Ok(())
    }

    /// Mutable access to the handler while no run holds it.
    ///
    /// Tasks of a stopped run keep the handler until they finish, so this
    /// returns `None` right after [`Processor::stop`]; call
    /// [`Processor::wait`] first.
    pub fn handler_mut(&mut self) -> Option<&mut dyn Handler> {
        if self.state == State::Running {
            return None;
        }
        let handler = Arc::get_mut(self.handler.as_mut()?)?;
        Some(handler)
    }

    /// Replaces the failure handler. Takes effect on the next start.
    pub fn set_failure_handler(&mut self, failure_handler: FailureHandler) {
        self.failure_handler = failure_handler;
    }

    /// Registers the processor counters under `prefix` and passes the
    /// provider on to the handler.
    pub fn set_metric_provider(
        &mut self,
        provider: Arc<dyn MetricProvider>,
        prefix: &str,
    ) -> Result<(), Error> {
        self.ensure_idle()?;
        if let Some(handler) = &self.handler {
            self.forward_metric_provider(handler, &provider)?;
        }
        self.counters = Some(StageCounters::register(provider, prefix));
        Ok(())
    }

    fn forward_metric_provider(
        &self,
        handler: &Arc<dyn Handler>,
        provider: &Arc<dyn MetricProvider>,
    ) -> Result<(), Error> {
        let prefix = format!("{}.{}", self.name, handler.name());
        handler
            .set_metric_provider(Arc::clone(provider), &prefix)
            .map_err(|source| Error::MetricProvider {
                processor: self.name.clone(),
                source,
            })
    }

    /// Adds output topics.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTopic` if a name is already an output or repeats
    /// in `topics`; no topic is added in that case.
    pub fn add_topics<I, S>(&mut self, topics: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        let mut added: Vec<String> = Vec::new();
        for topic in topics {
            let topic = topic.as_ref();
            if outputs.iter().any(|t| t == topic) || added.iter().any(|t| t == topic) {
                return Err(Error::DuplicateTopic {
                    processor: self.name.clone(),
                    topic: topic.to_string(),
                });
            }
            added.push(topic.to_string());
        }
        outputs.extend(added);
        Ok(())
    }

    /// Subscribes to `topics` on the engine.
    ///
    /// Subscriptions added while running start delivering immediately.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTopic` if this processor already subscribes to
    /// one of the topics. Nothing is registered when any subscription fails.
    pub async fn subscribe<I, S>(&mut self, topics: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let topics: Vec<String> = topics.into_iter().map(|t| t.as_ref().to_string()).collect();
        for topic in &topics {
            if self.subscriptions.contains_key(topic) || !seen.insert(topic.as_str()) {
                return Err(Error::DuplicateTopic {
                    processor: self.name.clone(),
                    topic: topic.clone(),
                });
            }
        }

        let subscriber_id = self.subscriber_id();
        let mut registered = Vec::with_capacity(topics.len());
        for topic in topics {
            match self
                .engine
                .subscribe(&topic, &subscriber_id, self.queue_size)
                .await
            {
                Ok(pipe) => registered.push((topic, pipe)),
                Err(e) => {
                    for (topic, _) in &registered {
                        if let Err(e) = self.engine.unsubscribe(topic, &subscriber_id).await {
                            warn!(processor = %self.name, topic = %topic, "{}", e);
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        for (topic, pipe) in registered {
            debug!(processor = %self.name, topic = %topic, "Subscription added");
            let pipe = Arc::new(Mutex::new(pipe));
            if self.run.is_some() {
                self.spawn_delivery(Arc::clone(&pipe));
            }
            self.subscriptions.insert(topic, pipe);
        }
        Ok(())
    }

    /// Removes a subscription. Its delivery task ends once the pipe is empty.
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), Error> {
        if !self.subscriptions.contains_key(topic) {
            return Err(Error::NoSuchTopic {
                processor: self.name.clone(),
                topic: topic.to_string(),
            });
        }
        self.engine.unsubscribe(topic, &self.subscriber_id()).await?;
        self.subscriptions.remove(topic);
        debug!(processor = %self.name, topic, "Subscription removed");
        Ok(())
    }

    /// Opens a fresh egress channel and returns its receiving end.
    ///
    /// A previous egress, if any, is closed.
    pub fn take_egress(&mut self) -> Result<Pipe, Error> {
        let (tx, pipe) = Pipe::channel(EGRESS_TOPIC, &self.subscriber_id(), self.queue_size)?;
        *self.egress.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(pipe)
    }

    /// Wires `pipe` as the processor's direct input.
    pub fn set_ingress(&mut self, pipe: Pipe) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ingress = Some(Arc::new(Mutex::new(pipe)));
        Ok(())
    }

    /// Drops the direct input so the next start can be chained afresh.
    pub fn clear_ingress(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.ingress = None;
        Ok(())
    }

    /// Starts the processor under a child of `parent`.
    ///
    /// Starting a running processor is a no-op.
    ///
    /// # Errors
    /// - `Error::NoHandler` when no handler is set
    /// - `Error::ConfigInvalid` when the handler configuration does not validate
    /// - `Error::IngressRequired` when a handler that needs input has neither
    ///   subscriptions nor an ingress
    #[tracing::instrument(skip_all, fields(processor = %self.name, id = self.id))]
    pub fn start(&mut self, parent: &CancellationToken) -> Result<(), Error> {
        if self.state == State::Running {
            return Ok(());
        }

        let handler = self
            .handler
            .clone()
            .ok_or_else(|| Error::NoHandler(self.name.clone()))?;
        handler
            .validate_configuration()
            .map_err(|source| Error::ConfigInvalid {
                processor: self.name.clone(),
                source,
            })?;
        let subscriptionless = handler.subscriptionless();
        if !subscriptionless && self.subscriptions.is_empty() && self.ingress.is_none() {
            return Err(Error::IngressRequired(self.name.clone()));
        }

        let token = parent.child_token();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let ctx = TaskContextBuilder::new()
            .processor_id(self.id)
            .processor_name(self.name.clone())
            .interval(self.interval)
            .cancellation(token.clone())
            .failures(failures_tx)
            .build()?;
        let outputs = Outputs::wired(
            &self.name,
            Arc::clone(&self.engine),
            Arc::clone(&self.outputs),
            Arc::clone(&self.egress),
            self.counters.clone(),
        );

        self.tasks.retain(|task| !task.is_finished());
        let tracker = TaskTracker::new();
        tracker.close();
        self.run = Some(Run {
            token,
            tracker,
            handler,
            ctx,
            outputs,
        });
        self.spawn_failure_monitor(failures_rx);

        if subscriptionless {
            self.spawn_self_driving();
        } else {
            let inputs: Vec<SharedPipe> = self
                .subscriptions
                .values()
                .chain(self.ingress.iter())
                .cloned()
                .collect();
            for pipe in inputs {
                self.spawn_delivery(pipe);
            }
        }

        self.state = State::Running;
        info!("Processor started");
        Ok(())
    }

    /// Signals cancellation to every task of the current run and returns.
    ///
    /// In-flight `handle` calls run to completion.
    ///
    /// # Errors
    /// Returns `Error::AlreadyStopped` when the processor is not running.
    #[tracing::instrument(skip_all, fields(processor = %self.name, id = self.id))]
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.state != State::Running {
            return Err(Error::AlreadyStopped(self.name.clone()));
        }
        let run = self
            .run
            .take()
            .ok_or_else(|| Error::AlreadyStopped(self.name.clone()))?;
        run.token.cancel();
        self.state = State::Stopped;
        info!("Processor stopped");
        Ok(())
    }

    /// Waits for every spawned task to finish.
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(processor = %self.name, "Processor task ended abnormally: {}", e);
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        match self.state {
            State::Running => Err(Error::Running(self.name.clone())),
            State::Created | State::Stopped => Ok(()),
        }
    }

    /// Hands failures of the current run to the failure handler.
    ///
    /// After cancellation it keeps listening until every task of the run has
    /// finished, so failures of in-flight `handle` calls are not lost.
    fn spawn_failure_monitor(&mut self, mut receiver: UnboundedReceiver<Failure>) {
        let Some(run) = &self.run else {
            return;
        };
        let token = run.token.clone();
        let tracker = run.tracker.clone();
        let failure_handler = Arc::clone(&self.failure_handler);
        let counters = self.counters.clone();
        let span = tracing::Span::current();

        let task = tokio::spawn(
            async move {
                let notify = |failure: Failure| {
                    if let Some(counters) = &counters {
                        counters.record_failure();
                    }
                    failure_handler(failure);
                };

                loop {
                    tokio::select! {
                        biased;
                        failure = receiver.recv() => match failure {
                            Some(failure) => notify(failure),
                            None => return,
                        },
                        _ = token.cancelled() => break,
                    }
                }
                loop {
                    tokio::select! {
                        biased;
                        failure = receiver.recv() => match failure {
                            Some(failure) => notify(failure),
                            None => return,
                        },
                        _ = tracker.wait() => break,
                    }
                }
                while let Ok(failure) = receiver.try_recv() {
                    notify(failure);
                }
            }
            .instrument(span),
        );
        self.tasks.push(task);
    }

    fn spawn_self_driving(&mut self) {
        let Some(run) = &self.run else {
            return;
        };
        let token = run.token.clone();
        let tracker = run.tracker.clone();
        let handler = Arc::clone(&run.handler);
        let ctx = run.ctx.clone();
        let outputs = run.outputs.clone();
        let span = tracing::Span::current();

        let task = tracker.spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    result = handler.handle(&ctx, None, &outputs) => {
                        if let Err(e) = result {
                            ctx.fail(e, None);
                        }
                    }
                }
            }
            .instrument(span),
        );
        self.tasks.push(task);
    }

    fn spawn_delivery(&mut self, pipe: SharedPipe) {
        let Some(run) = &self.run else {
            return;
        };
        let token = run.token.clone();
        let tracker = run.tracker.clone();
        let handler = Arc::clone(&run.handler);
        let ctx = run.ctx.clone();
        let outputs = run.outputs.clone();
        let counters = self.counters.clone();
        let span = tracing::Span::current();

        let task = tracker.spawn(
            async move {
                // The previous run may still hold the pipe until its in-flight payload is done.
                let mut pipe = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    pipe = pipe.lock_owned() => pipe,
                };
                debug!(topic = pipe.topic(), "Delivery started");

                loop {
                    let payload = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        payload = pipe.recv() => match payload {
                            Some(payload) => payload,
                            None => break,
                        },
                    };
                    if let Some(counters) = &counters {
                        counters.record_in(1);
                    }
                    if let Err(e) = handler.handle(&ctx, Some(payload.clone()), &outputs).await {
                        ctx.fail(e, Some(payload));
                    }
                }
                debug!(topic = pipe.topic(), "Delivery stopped");
            }
            .instrument(span),
        );
        self.tasks.push(task);
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            run.token.cancel();
        }
    }
}

/// Builder for processors.
#[derive(Default)]
pub struct ProcessorBuilder {
    name: Option<String>,
    engine: Option<Arc<dyn Engine>>,
    handler: Option<Box<dyn Handler>>,
    queue_size: Option<usize>,
    interval: Option<Duration>,
    topics: Vec<String>,
    failure_handler: Option<FailureHandler>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Capacity of each subscription and egress queue.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    /// Output topics.
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.topics
            .extend(topics.into_iter().map(|t| t.as_ref().to_string()));
        self
    }

    pub fn failure_handler(mut self, failure_handler: FailureHandler) -> Self {
        self.failure_handler = Some(failure_handler);
        self
    }

    /// Builds the processor in the `Created` state.
    ///
    /// # Errors
    /// Returns `Error::MissingBuilderAttribute` when name or engine is missing
    /// and `Error::DuplicateTopic` when an output topic repeats.
    pub fn build(self) -> Result<Processor, Error> {
        let name = self
            .name
            .ok_or_else(|| Error::MissingBuilderAttribute("name".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| Error::MissingBuilderAttribute("engine".to_string()))?;
        let mut processor = Processor {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            name,
            engine,
            handler: self.handler.map(Arc::from),
            state: State::Created,
            queue_size: self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            interval: self.interval,
            outputs: Arc::new(RwLock::new(Vec::new())),
            subscriptions: BTreeMap::new(),
            ingress: None,
            egress: Arc::new(std::sync::Mutex::new(None)),
            failure_handler: self.failure_handler.unwrap_or_else(log_failures),
            counters: None,
            run: None,
            tasks: Vec::new(),
        };
        processor.add_topics(self.topics)?;
        Ok(processor)
    }
}
