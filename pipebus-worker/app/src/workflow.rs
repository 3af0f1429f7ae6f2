//! Ordered pipeline of processors started and stopped as a unit.
//!
//! On start, a stage that has no subscriptions, no ingress and needs input is
//! chained to the egress of the stage before it.

use crate::definition::{HandlerDefinition, ProcessorDefinition, WorkflowDefinition};
use pipebus_core::task::processor::{self, Processor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors that can occur while managing a workflow.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Index {index} is out of range for workflow '{workflow}' with {len} processors")]
    IndexOutOfRange {
        workflow: String,
        index: usize,
        len: usize,
    },
    #[error("Error wiring processor '{processor}' of workflow '{workflow}': {source}")]
    Wire {
        workflow: String,
        processor: String,
        #[source]
        source: processor::Error,
    },
    #[error("Error starting processor '{processor}' of workflow '{workflow}': {source}")]
    Start {
        workflow: String,
        processor: String,
        #[source]
        source: processor::Error,
    },
    #[error("Error stopping processor '{processor}' of workflow '{workflow}': {source}")]
    Stop {
        workflow: String,
        processor: String,
        #[source]
        source: processor::Error,
    },
}

/// Named, ordered list of processors.
#[derive(Debug)]
pub struct Workflow {
    name: String,
    processors: Vec<Processor>,
    token: Option<CancellationToken>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Workflow {
            name: name.into(),
            processors: Vec::new(),
            token: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    pub fn processor_mut(&mut self, index: usize) -> Option<&mut Processor> {
        self.processors.get_mut(index)
    }

    pub fn add_processor(&mut self, processor: Processor) {
        self.processors.push(processor);
    }

    /// Removes the processor at `index`.
    ///
    /// The stage that followed it loses its ingress and is chained to its new
    /// predecessor on the next start. Running stages keep their current wiring
    /// until they are stopped and started again.
    pub fn remove_processor(&mut self, index: usize) -> Result<Processor, Error> {
        if index >= self.processors.len() {
            return Err(Error::IndexOutOfRange {
                workflow: self.name.clone(),
                index,
                len: self.processors.len(),
            });
        }
        let removed = self.processors.remove(index);
        if let Some(next) = self.processors.get_mut(index) {
            if next.has_ingress() && !next.is_running() {
                next.clear_ingress().map_err(|source| Error::Wire {
                    workflow: self.name.clone(),
                    processor: next.name().to_string(),
                    source,
                })?;
            }
        }
        Ok(removed)
    }

    /// Sets the parent token every processor start derives from.
    pub fn set_context(&mut self, token: CancellationToken) {
        self.token = Some(token);
    }

    pub fn is_running(&self) -> bool {
        self.processors.iter().any(Processor::is_running)
    }

    /// Starts every processor in order, chaining stages that need input.
    ///
    /// Running processors are skipped. The first failure aborts the remaining
    /// starts; already started processors keep running.
    #[tracing::instrument(skip_all, fields(workflow = %self.name))]
    pub fn start(&mut self) -> Result<(), Error> {
        self.start_selected(|_, _| true)?;
        info!("Workflow started");
        Ok(())
    }

    pub(crate) fn start_selected<F>(&mut self, selected: F) -> Result<(), Error>
    where
        F: Fn(usize, &Processor) -> bool,
    {
        let token = self.token.get_or_insert_with(CancellationToken::new).clone();

        for index in 0..self.processors.len() {
            if !selected(index, &self.processors[index]) {
                continue;
            }
            self.chain(index)?;

            let processor = &mut self.processors[index];
            if processor.is_running() {
                continue;
            }
            processor.start(&token).map_err(|source| Error::Start {
                workflow: self.name.clone(),
                processor: processor.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn chain(&mut self, index: usize) -> Result<(), Error> {
        if index == 0 {
            return Ok(());
        }
        let (head, tail) = self.processors.split_at_mut(index);
        let previous = &mut head[index - 1];
        let current = &mut tail[0];
        if current.is_running()
            || current.is_subscriptionless()
            || current.has_ingress()
            || !current.subscriptions().is_empty()
        {
            return Ok(());
        }

        let wire_error = |processor: &Processor, source| Error::Wire {
            workflow: self.name.clone(),
            processor: processor.name().to_string(),
            source,
        };
        let pipe = previous
            .take_egress()
            .map_err(|source| wire_error(previous, source))?;
        current
            .set_ingress(pipe)
            .map_err(|source| wire_error(current, source))?;
        debug!(from = previous.name(), to = current.name(), "Chained processors");
        Ok(())
    }

    /// Stops every running processor.
    #[tracing::instrument(skip_all, fields(workflow = %self.name))]
    pub fn stop(&mut self) -> Result<(), Error> {
        for processor in self.processors.iter_mut() {
            match processor.stop() {
                Ok(()) | Err(processor::Error::AlreadyStopped(_)) => {}
                Err(source) => {
                    return Err(Error::Stop {
                        workflow: self.name.clone(),
                        processor: processor.name().to_string(),
                        source,
                    })
                }
            }
        }
        info!("Workflow stopped");
        Ok(())
    }

    /// Waits for the tasks of every processor to finish.
    pub async fn wait(&mut self) {
        for processor in self.processors.iter_mut() {
            processor.wait().await;
        }
    }

    /// Snapshot of the workflow in its persisted form.
    pub fn to_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name.clone(),
            processors: self
                .processors
                .iter()
                .map(|processor| ProcessorDefinition {
                    id: Some(processor.id()),
                    name: processor.name().to_string(),
                    running: processor.is_running(),
                    topics: processor.outputs(),
                    subscriptions: processor.subscriptions(),
                    interval: processor.interval(),
                    queue_size: Some(processor.queue_size()),
                    handler: processor.handler().map(|handler| HandlerDefinition {
                        name: handler.name().to_string(),
                        configuration: handler.configuration().values(),
                    }),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipebus_core::bus::memory::MemoryEngineBuilder;
    use pipebus_core::bus::Engine;
    use pipebus_core::task::generate::handler::Generate;
    use pipebus_core::task::handler::Handler;
    use pipebus_core::task::log::handler::Log;
    use pipebus_core::task::processor::{ProcessorBuilder, State};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> Arc<dyn Engine> {
        Arc::new(MemoryEngineBuilder::new().build())
    }

    fn generator(engine: &Arc<dyn Engine>, name: &str, count: u64) -> Processor {
        let mut handler = Generate::new();
        handler.configuration_mut().set("source", "X").unwrap();
        handler.configuration_mut().set("interval", 20).unwrap();
        handler.configuration_mut().set("count", count).unwrap();
        ProcessorBuilder::new()
            .name(name)
            .engine(Arc::clone(engine))
            .handler(Box::new(handler))
            .build()
            .unwrap()
    }

    fn logger(engine: &Arc<dyn Engine>, name: &str) -> Processor {
        ProcessorBuilder::new()
            .name(name)
            .engine(Arc::clone(engine))
            .handler(Box::new(Log::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_chained_into_log() {
        let engine = engine();
        let mut printer = logger(&engine, "B");
        let mut out = printer.take_egress().unwrap();
        let mut workflow = Workflow::new("hello");
        workflow.add_processor(generator(&engine, "A", 1));
        workflow.add_processor(printer);

        workflow.start().unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.source, "X");
        assert_eq!(payload.content_str(), "Hello from: X");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());
        assert!(workflow.processors()[1].has_ingress());
        workflow.stop().unwrap();
    }

    #[tokio::test]
    async fn test_output_topic_subscriber_receives_payload() {
        let engine = engine();
        let mut probe = engine.subscribe("greetings", "probe", 4).await.unwrap();
        let mut printer = logger(&engine, "B");
        printer.add_topics(["greetings"]).unwrap();
        let mut workflow = Workflow::new("hello");
        workflow.add_processor(generator(&engine, "A", 1));
        workflow.add_processor(printer);

        workflow.start().unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), probe.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.source, "X");
        workflow.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stage_without_input_requires_ingress() {
        let engine = engine();
        let mut workflow = Workflow::new("headless");
        workflow.add_processor(logger(&engine, "B"));

        let result = workflow.start();

        assert!(matches!(
            result,
            Err(Error::Start { source: processor::Error::IngressRequired(_), .. })
        ));
        assert!(!workflow.is_running());
    }

    #[tokio::test]
    async fn test_start_aborts_on_first_failure() {
        let engine = engine();
        let no_handler = ProcessorBuilder::new()
            .name("empty")
            .engine(Arc::clone(&engine))
            .build()
            .unwrap();
        let mut workflow = Workflow::new("broken");
        workflow.add_processor(generator(&engine, "A", 1));
        workflow.add_processor(no_handler);
        workflow.add_processor(generator(&engine, "C", 1));

        let result = workflow.start();

        assert!(matches!(
            result,
            Err(Error::Start { processor, source: processor::Error::NoHandler(_), .. }) if processor == "empty"
        ));
        assert_eq!(workflow.processors()[0].state(), State::Running);
        assert_eq!(workflow.processors()[2].state(), State::Created);
        workflow.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stop_twice_and_restart() {
        let engine = engine();
        let mut workflow = Workflow::new("restart");
        workflow.add_processor(generator(&engine, "A", 1));
        workflow.add_processor(logger(&engine, "B"));

        workflow.start().unwrap();
        workflow.stop().unwrap();
        workflow.stop().unwrap();
        assert!(!workflow.is_running());

        workflow.start().unwrap();
        assert!(workflow.processors().iter().all(Processor::is_running));
        workflow.stop().unwrap();
        workflow.wait().await;
    }

    #[tokio::test]
    async fn test_remove_processor() {
        let engine = engine();
        let mut workflow = Workflow::new("w");
        workflow.add_processor(generator(&engine, "A", 1));

        assert!(matches!(
            workflow.remove_processor(3),
            Err(Error::IndexOutOfRange { index: 3, len: 1, .. })
        ));
        assert_eq!(workflow.remove_processor(0).unwrap().name(), "A");
        assert!(workflow.processors().is_empty());
    }

    #[tokio::test]
    async fn test_remove_middle_stage_rechains_neighbours() {
        let engine = engine();
        let mut workflow = Workflow::new("w");
        workflow.add_processor(generator(&engine, "A", 100));
        workflow.add_processor(logger(&engine, "B"));
        workflow.add_processor(logger(&engine, "C"));
        workflow.start().unwrap();
        workflow.stop().unwrap();
        workflow.wait().await;

        assert_eq!(workflow.remove_processor(1).unwrap().name(), "B");
        assert!(!workflow.processors()[1].has_ingress());
        let mut out = workflow.processor_mut(1).unwrap().take_egress().unwrap();
        workflow.start().unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.source, "X");
        assert!(workflow.processors()[1].has_ingress());
        workflow.stop().unwrap();
    }

    #[tokio::test]
    async fn test_to_definition() {
        let engine = engine();
        let mut printer = logger(&engine, "B");
        printer.subscribe(["in"]).await.unwrap();
        printer.add_topics(["out"]).unwrap();
        let mut workflow = Workflow::new("snapshot");
        workflow.add_processor(generator(&engine, "A", 5));
        workflow.add_processor(printer);

        let definition = workflow.to_definition();

        assert_eq!(definition.name, "snapshot");
        let a = &definition.processors[0];
        assert_eq!(a.id, Some(workflow.processors()[0].id()));
        assert!(!a.running);
        let handler = a.handler.as_ref().unwrap();
        assert_eq!(handler.name, "generate");
        assert_eq!(handler.configuration.get("count"), Some(&json!(5)));
        let b = &definition.processors[1];
        assert_eq!(b.subscriptions, vec!["in"]);
        assert_eq!(b.topics, vec!["out"]);
        assert_eq!(b.queue_size, Some(processor::DEFAULT_QUEUE_SIZE));
    }
}
