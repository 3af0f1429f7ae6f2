use crate::application::{self, ApplicationBuilder};
use crate::config::{AppConfig, EngineType};
use crate::definition::WorkflowDefinition;
use pipebus_core::bus::memory::{MemoryEngine, MemoryEngineBuilder};
use pipebus_core::bus::Engine;
use pipebus_core::client::Client;
use pipebus_nats::engine::NatsEngine;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Errors that can occur during application execution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// File system error occurred while globbing definition files.
    #[error("Failed to glob workflow definition files: {source}")]
    Glob {
        #[source]
        source: glob::GlobError,
    },
    #[error("Invalid glob pattern: {source}")]
    Pattern {
        #[source]
        source: glob::PatternError,
    },
    /// Workflow path is unset or not valid UTF-8.
    #[error("Invalid path")]
    InvalidPath,
    #[error(transparent)]
    NatsClient(#[from] pipebus_nats::client::Error),
    #[error("NATS client is not connected")]
    NotConnected,
    #[error(transparent)]
    Application(#[from] application::Error),
    #[error("Failed to wait for shutdown signal: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

/// Engine built from the configuration, kept concrete for shutdown.
enum Backend {
    Memory(MemoryEngine),
    Nats(NatsEngine),
}

impl Backend {
    fn engine(&self) -> Arc<dyn Engine> {
        match self {
            Backend::Memory(engine) => Arc::new(engine.clone()),
            Backend::Nats(engine) => Arc::new(engine.clone()),
        }
    }

    fn shutdown(&self) {
        match self {
            Backend::Memory(engine) => engine.shutdown(),
            Backend::Nats(engine) => engine.shutdown(),
        }
    }
}

/// Main application that loads workflow definitions and runs them until shutdown.
pub struct App {
    pub config: AppConfig,
}

impl App {
    /// Runs until `shutdown` resolves, then stops every workflow.
    #[tracing::instrument(skip_all, name = "app")]
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = Result<(), std::io::Error>> + Send,
    {
        let paths = self.definition_paths()?;
        let backend = self.backend().await?;
        let mut application = ApplicationBuilder::new()
            .engine(backend.engine())
            .queue_size(self.config.queue_size)
            .build()?;

        for path in paths {
            info!("Loading workflow: {:?}", path);
            let definition = match WorkflowDefinition::from_path(&path) {
                Ok(definition) => definition,
                Err(e) => {
                    error!("Workflow definition skipped: {}", e);
                    continue;
                }
            };
            if let Err(e) = application.load_definition(&definition).await {
                error!("Workflow load failed: {}", e);
            }
        }

        let result = match application.start() {
            Ok(()) => shutdown.await.map_err(|source| Error::Signal { source }),
            Err(e) => Err(e.into()),
        };

        info!("Shutting down");
        if let Err(e) = application.stop() {
            error!("{}", e);
        }
        application.wait().await;
        backend.shutdown();
        result
    }

    async fn backend(&self) -> Result<Backend, Error> {
        let options = &self.config.engine;
        match options.engine_type {
            EngineType::Memory => {
                let engine = MemoryEngineBuilder::new()
                    .buffer_size(options.buffer_size)
                    .drain_interval(options.drain_interval)
                    .build();
                engine.spawn_drain();
                Ok(Backend::Memory(engine))
            }
            EngineType::Nats => {
                let client = pipebus_nats::client::ClientBuilder::new()
                    .url(options.nats.url.clone())
                    .credentials_path(options.nats.credentials_path.clone())
                    .retry(options.nats.retry.clone())
                    .build()
                    .connect()
                    .await?;
                let nats_client = client.nats_client.ok_or(Error::NotConnected)?;
                Ok(Backend::Nats(NatsEngine::new(nats_client)))
            }
        }
    }

    fn definition_paths(&self) -> Result<Vec<PathBuf>, Error> {
        let pattern = self
            .config
            .workflows
            .path
            .as_ref()
            .and_then(|path| path.to_str())
            .ok_or(Error::InvalidPath)?;

        glob::glob(pattern)
            .map_err(|source| Error::Pattern { source })?
            .map(|path| path.map_err(|source| Error::Glob { source }))
            .collect()
    }
}

impl pipebus_core::task::runner::Runner for App {
    type Error = Error;

    /// Runs until ctrl-c.
    async fn run(self) -> Result<(), Error> {
        self.run_until(tokio::signal::ctrl_c()).await
    }
}
