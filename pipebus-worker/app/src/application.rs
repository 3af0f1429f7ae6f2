//! Top-level owner of workflows sharing one engine.

use crate::definition::WorkflowDefinition;
use crate::workflow::{self, Workflow};
use pipebus_core::bus::Engine;
use pipebus_core::metrics::MetricProvider;
use pipebus_core::properties;
use pipebus_core::task::failure::FailureHandler;
use pipebus_core::task::processor::{self, Processor, ProcessorBuilder, DEFAULT_QUEUE_SIZE};
use pipebus_core::task::registry::{self, HandlerRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors that can occur while managing an application.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Workflow '{}' already exists", _0)]
    DuplicateName(String),
    #[error("Workflow '{}' not found", _0)]
    WorkflowNotFound(String),
    #[error(transparent)]
    Workflow(#[from] workflow::Error),
    #[error(transparent)]
    Processor(#[from] processor::Error),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error("Error configuring processor '{processor}': {source}")]
    Configuration {
        processor: String,
        #[source]
        source: properties::Error,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Collection of uniquely named workflows.
///
/// Every workflow runs under a child of the application token, so cancelling
/// the parent passed to the builder stops everything.
pub struct Application {
    workflows: Vec<Workflow>,
    engine: Arc<dyn Engine>,
    registry: HandlerRegistry,
    token: CancellationToken,
    queue_size: usize,
    failure_handler: Option<FailureHandler>,
    metrics: Option<Arc<dyn MetricProvider>>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("workflows", &self.workflows)
            .field("engine", &self.engine.kind())
            .field("registry", &self.registry)
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl Application {
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name() == name)
    }

    pub fn workflow_mut(&mut self, name: &str) -> Option<&mut Workflow> {
        self.workflows.iter_mut().find(|w| w.name() == name)
    }

    /// Adds a workflow.
    ///
    /// # Errors
    /// Returns `Error::DuplicateName` if a workflow with the same name exists.
    pub fn add_workflow(&mut self, mut workflow: Workflow) -> Result<(), Error> {
        if self.workflow(workflow.name()).is_some() {
            return Err(Error::DuplicateName(workflow.name().to_string()));
        }
        workflow.set_context(self.token.child_token());
        self.workflows.push(workflow);
        Ok(())
    }

    /// Appends a processor to the named workflow.
    pub fn add_processor(&mut self, processor: Processor, workflow: &str) -> Result<(), Error> {
        self.workflow_mut(workflow)
            .ok_or_else(|| Error::WorkflowNotFound(workflow.to_string()))?
            .add_processor(processor);
        Ok(())
    }

    /// Starts every workflow in insertion order, aborting on the first error.
    #[tracing::instrument(skip_all)]
    pub fn start(&mut self) -> Result<(), Error> {
        for workflow in self.workflows.iter_mut() {
            workflow.start()?;
        }
        info!(workflows = self.workflows.len(), "Application started");
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn stop(&mut self) -> Result<(), Error> {
        for workflow in self.workflows.iter_mut() {
            workflow.stop()?;
        }
        info!("Application stopped");
        Ok(())
    }

    /// Waits for the tasks of every workflow to finish.
    pub async fn wait(&mut self) {
        for workflow in self.workflows.iter_mut() {
            workflow.wait().await;
        }
    }

    /// Rebuilds a workflow from its definition and adds it.
    ///
    /// Handlers are resolved in the registry and configured from the
    /// definition. Processors flagged `running` are started before the
    /// workflow is added. On any error the workflow is not added, started
    /// processors are stopped and every engine subscription made for it is
    /// removed again.
    #[tracing::instrument(skip_all, fields(workflow = %definition.name))]
    pub async fn load_definition(&mut self, definition: &WorkflowDefinition) -> Result<(), Error> {
        if self.workflow(&definition.name).is_some() {
            return Err(Error::DuplicateName(definition.name.clone()));
        }

        let mut workflow = Workflow::new(definition.name.clone());
        let mut running = Vec::with_capacity(definition.processors.len());
        for processor_definition in &definition.processors {
            let mut builder = ProcessorBuilder::new()
                .name(processor_definition.name.clone())
                .engine(Arc::clone(&self.engine))
                .queue_size(processor_definition.queue_size.unwrap_or(self.queue_size))
                .interval(processor_definition.interval)
                .topics(&processor_definition.topics);
            if let Some(failure_handler) = &self.failure_handler {
                builder = builder.failure_handler(Arc::clone(failure_handler));
            }
            if let Some(handler_definition) = &processor_definition.handler {
                let mut handler = self.registry.create(&handler_definition.name)?;
                handler
                    .configuration_mut()
                    .apply(&handler_definition.configuration)
                    .map_err(|source| Error::Configuration {
                        processor: processor_definition.name.clone(),
                        source,
                    })?;
                builder = builder.handler(handler);
            }

            let mut processor = builder.build()?;
            if let Some(metrics) = &self.metrics {
                let prefix = format!("{}.{}", definition.name, processor_definition.name);
                processor.set_metric_provider(Arc::clone(metrics), &prefix)?;
            }
            running.push(processor_definition.running);
            workflow.add_processor(processor);
        }

        for (index, processor_definition) in definition.processors.iter().enumerate() {
            let Some(processor) = workflow.processor_mut(index) else {
                continue;
            };
            if let Err(e) = processor.subscribe(&processor_definition.subscriptions).await {
                release_subscriptions(&mut workflow).await;
                return Err(e.into());
            }
        }

        workflow.set_context(self.token.child_token());
        if let Err(e) = workflow.start_selected(|index, _| running[index]) {
            if let Err(e) = workflow.stop() {
                warn!("{}", e);
            }
            workflow.wait().await;
            release_subscriptions(&mut workflow).await;
            return Err(e.into());
        }

        self.workflows.push(workflow);
        info!(processors = running.len(), "Workflow loaded");
        Ok(())
    }
}

/// Unsubscribes every processor of a workflow that is being discarded.
async fn release_subscriptions(workflow: &mut Workflow) {
    for index in 0..workflow.processors().len() {
        let Some(processor) = workflow.processor_mut(index) else {
            continue;
        };
        for topic in processor.subscriptions() {
            if let Err(e) = processor.unsubscribe(&topic).await {
                warn!("{}", e);
            }
        }
    }
}

/// Builder for applications.
#[derive(Default)]
pub struct ApplicationBuilder {
    engine: Option<Arc<dyn Engine>>,
    registry: Option<HandlerRegistry>,
    cancellation: Option<CancellationToken>,
    queue_size: Option<usize>,
    failure_handler: Option<FailureHandler>,
    metrics: Option<Arc<dyn MetricProvider>>,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Handlers available to definitions. Defaults to the bundled handlers.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Parent token of the application.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Queue size of loaded processors whose definition sets none.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    /// Failure handler of loaded processors.
    pub fn failure_handler(mut self, failure_handler: FailureHandler) -> Self {
        self.failure_handler = Some(failure_handler);
        self
    }

    /// Metric provider of loaded processors.
    pub fn metric_provider(mut self, provider: Arc<dyn MetricProvider>) -> Self {
        self.metrics = Some(provider);
        self
    }

    pub fn build(self) -> Result<Application, Error> {
        let engine = self
            .engine
            .ok_or_else(|| Error::MissingBuilderAttribute("engine".to_string()))?;
        let token = match self.cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Ok(Application {
            workflows: Vec::new(),
            engine,
            registry: self.registry.unwrap_or_else(HandlerRegistry::with_builtins),
            token,
            queue_size: self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            failure_handler: self.failure_handler,
            metrics: self.metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{HandlerDefinition, ProcessorDefinition};
    use pipebus_core::bus::memory::MemoryEngineBuilder;
    use pipebus_core::metrics::MemoryMetrics;
    use async_trait::async_trait;
    use pipebus_core::payload::Payload;
    use pipebus_core::properties::Properties;
    use pipebus_core::task::context::TaskContext;
    use pipebus_core::task::failure::Failure;
    use pipebus_core::task::handler::{Handler, Outputs};
    use pipebus_core::task::processor::State;
    use pipebus_core::BoxError;
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn engine() -> Arc<dyn Engine> {
        Arc::new(MemoryEngineBuilder::new().build())
    }

    fn configuration(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn processor_definition(name: &str, handler: &str, config: Value) -> ProcessorDefinition {
        ProcessorDefinition {
            id: None,
            name: name.to_string(),
            running: true,
            topics: Vec::new(),
            subscriptions: Vec::new(),
            interval: None,
            queue_size: None,
            handler: Some(HandlerDefinition {
                name: handler.to_string(),
                configuration: configuration(config),
            }),
        }
    }

    fn hello_definition() -> WorkflowDefinition {
        let mut printer = processor_definition("printer", "log", json!({}));
        printer.topics = vec!["greetings".to_string()];
        WorkflowDefinition {
            name: "hello".to_string(),
            processors: vec![
                processor_definition(
                    "greeter",
                    "generate",
                    json!({"source": "X", "interval": 20, "count": 1}),
                ),
                printer,
            ],
        }
    }

    #[tokio::test]
    async fn test_duplicate_workflow_name() {
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();
        app.add_workflow(Workflow::new("w")).unwrap();

        let result = app.add_workflow(Workflow::new("w"));

        assert!(matches!(result, Err(Error::DuplicateName(name)) if name == "w"));
        assert_eq!(app.workflows().len(), 1);
    }

    #[tokio::test]
    async fn test_add_processor_to_unknown_workflow() {
        let engine = engine();
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .build()
            .unwrap();
        let processor = ProcessorBuilder::new()
            .name("p")
            .engine(engine)
            .build()
            .unwrap();

        let result = app.add_processor(processor, "missing");

        assert!(matches!(result, Err(Error::WorkflowNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_builder_requires_engine() {
        let result = ApplicationBuilder::new().build();
        assert!(matches!(result, Err(Error::MissingBuilderAttribute(_))));
    }

    #[tokio::test]
    async fn test_load_definition_starts_running_processors() {
        let engine = engine();
        let metrics = Arc::new(MemoryMetrics::new());
        let mut probe = engine.subscribe("greetings", "probe", 4).await.unwrap();
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .metric_provider(metrics.clone())
            .build()
            .unwrap();

        app.load_definition(&hello_definition()).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), probe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.source, "X");
        assert_eq!(payload.content_str(), "Hello from: X");
        let workflow = app.workflow("hello").unwrap();
        assert!(workflow.processors().iter().all(Processor::is_running));
        assert_eq!(
            metrics.get("hello.printer.payloads_in").map(|m| m.value),
            Some(1)
        );
        app.stop().unwrap();
        app.wait().await;
    }

    #[tokio::test]
    async fn test_load_definition_leaves_idle_processors_created() {
        let mut definition = hello_definition();
        for processor in definition.processors.iter_mut() {
            processor.running = false;
        }
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();

        app.load_definition(&definition).await.unwrap();

        let workflow = app.workflow("hello").unwrap();
        assert!(workflow
            .processors()
            .iter()
            .all(|p| p.state() == State::Created));

        app.start().unwrap();
        assert!(app.workflow("hello").unwrap().is_running());
        app.stop().unwrap();
    }

    #[tokio::test]
    async fn test_load_definition_subscribes_and_sizes_queues() {
        let engine = engine();
        let mut definition = WorkflowDefinition {
            name: "sink".to_string(),
            processors: vec![processor_definition("printer", "log", json!({"label": "in"}))],
        };
        definition.processors[0].subscriptions = vec!["in".to_string()];
        definition.processors[0].running = false;
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .queue_size(8)
            .build()
            .unwrap();

        app.load_definition(&definition).await.unwrap();

        let printer = &app.workflow("sink").unwrap().processors()[0];
        assert_eq!(printer.subscriptions(), vec!["in"]);
        assert_eq!(printer.queue_size(), 8);
        assert_eq!(
            engine.subscribers("in").unwrap(),
            vec![printer.subscriber_id()]
        );
    }

    #[tokio::test]
    async fn test_load_definition_unknown_handler() {
        let definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![processor_definition("p", "transmogrify", json!({}))],
        };
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();

        let result = app.load_definition(&definition).await;

        assert!(matches!(
            result,
            Err(Error::Registry(registry::Error::UnknownHandler(name))) if name == "transmogrify"
        ));
        assert!(app.workflow("w").is_none());
    }

    #[tokio::test]
    async fn test_load_definition_unknown_property() {
        let definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![processor_definition("p", "log", json!({"colour": "red"}))],
        };
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();

        let result = app.load_definition(&definition).await;

        assert!(matches!(result, Err(Error::Configuration { processor, .. }) if processor == "p"));
    }

    #[tokio::test]
    async fn test_load_definition_duplicate_name() {
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();
        app.add_workflow(Workflow::new("hello")).unwrap();

        let result = app.load_definition(&hello_definition()).await;

        assert!(matches!(result, Err(Error::DuplicateName(_))));
    }

    #[tokio::test]
    async fn test_load_definition_invalid_configuration_fails_start() {
        let definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![processor_definition("greeter", "generate", json!({}))],
        };
        let mut app = ApplicationBuilder::new().engine(engine()).build().unwrap();

        let result = app.load_definition(&definition).await;

        assert!(matches!(
            result,
            Err(Error::Workflow(workflow::Error::Start {
                source: processor::Error::ConfigInvalid { .. },
                ..
            }))
        ));
        assert!(app.workflow("w").is_none());
        app.start().unwrap();
    }

    #[tokio::test]
    async fn test_load_definition_failed_start_releases_everything() {
        let engine = engine();
        let mut printer = processor_definition("printer", "log", json!({}));
        printer.subscriptions = vec!["in".to_string()];
        let definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![
                printer,
                processor_definition("greeter", "generate", json!({"interval": 10})),
            ],
        };
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .build()
            .unwrap();

        let result = app.load_definition(&definition).await;

        assert!(matches!(result, Err(Error::Workflow(workflow::Error::Start { processor, .. })) if processor == "greeter"));
        assert!(app.workflows().is_empty());
        assert!(engine.subscribers("in").unwrap().is_empty());
        let errors = engine.publish("in", vec![Payload::new("a", "test")]).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_load_definition_subscribe_error_releases_earlier_subscriptions() {
        let engine = engine();
        let mut printer = processor_definition("printer", "log", json!({}));
        printer.subscriptions = vec!["in".to_string()];
        let mut repeated = processor_definition("repeated", "log", json!({}));
        repeated.subscriptions = vec!["x".to_string(), "x".to_string()];
        let definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![printer, repeated],
        };
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .build()
            .unwrap();

        let result = app.load_definition(&definition).await;

        assert!(matches!(
            result,
            Err(Error::Processor(processor::Error::DuplicateTopic { topic, .. })) if topic == "x"
        ));
        assert!(app.workflow("w").is_none());
        assert!(engine.subscribers("in").unwrap().is_empty());
        app.load_definition(&WorkflowDefinition {
            name: "w".to_string(),
            processors: Vec::new(),
        })
        .await
        .unwrap();
    }

    struct Reject {
        properties: Properties,
    }

    #[async_trait]
    impl Handler for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn handle(
            &self,
            _ctx: &TaskContext,
            _payload: Option<Payload>,
            _outputs: &Outputs,
        ) -> Result<(), BoxError> {
            Err("rejected".into())
        }

        fn configuration(&self) -> &Properties {
            &self.properties
        }

        fn configuration_mut(&mut self) -> &mut Properties {
            &mut self.properties
        }
    }

    #[tokio::test]
    async fn test_failure_handler_applies_to_loaded_processors() {
        let engine = engine();
        let mut registry = HandlerRegistry::new();
        registry
            .register("reject", || {
                Box::new(Reject {
                    properties: Properties::new("reject"),
                }) as Box<dyn Handler>
            })
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut definition = WorkflowDefinition {
            name: "w".to_string(),
            processors: vec![processor_definition("gate", "reject", json!({}))],
        };
        definition.processors[0].subscriptions = vec!["in".to_string()];
        let mut app = ApplicationBuilder::new()
            .engine(Arc::clone(&engine))
            .registry(registry)
            .failure_handler(Arc::new(move |failure: Failure| {
                let _ = tx.send(failure);
            }))
            .build()
            .unwrap();
        app.load_definition(&definition).await.unwrap();

        let errors = engine.publish("in", vec![Payload::new("a", "test")]).await;
        assert!(errors.is_empty());

        let failure = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.processor_name, "gate");
        assert_eq!(failure.error.to_string(), "rejected");
        assert_eq!(failure.payload.unwrap().content_str(), "a");
        app.stop().unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_workflows() {
        let parent = CancellationToken::new();
        let mut app = ApplicationBuilder::new()
            .engine(engine())
            .cancellation(parent.clone())
            .build()
            .unwrap();
        let mut definition = hello_definition();
        definition.processors[0].handler = Some(HandlerDefinition {
            name: "generate".to_string(),
            configuration: configuration(json!({"source": "X", "interval": 20})),
        });
        app.load_definition(&definition).await.unwrap();

        parent.cancel();

        tokio::time::timeout(Duration::from_secs(2), app.wait())
            .await
            .unwrap();
    }
}
