//! Persisted workflow definitions.
//!
//! A definition file holds one workflow under the `workflow` key:
//!
//! ```yaml
//! workflow:
//!   name: hello
//!   processors:
//!     - name: greeter
//!       running: true
//!       handler:
//!         name: generate
//!         configuration:
//!           source: X
//!     - name: printer
//!       running: true
//!       topics: [greetings]
//!       handler:
//!         name: log
//! ```

use config::{Config, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur while reading definition files.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error reading definition file '{path}': {source}")]
    IO {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing definition file '{path}': {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
}

/// Top-level layout of a definition file.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct DefinitionFile {
    pub workflow: WorkflowDefinition,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Stages in pipeline order.
    #[serde(default)]
    pub processors: Vec<ProcessorDefinition>,
}

/// Snapshot of one processor.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct ProcessorDefinition {
    /// Id the processor had when the snapshot was taken. Ignored on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    /// Start the processor right after loading.
    #[serde(default)]
    pub running: bool,
    /// Output topics.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Topics to subscribe to.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Execution interval, e.g. "5s".
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerDefinition>,
}

/// Handler name resolved against the registry, plus its configuration values.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct HandlerDefinition {
    pub name: String,
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

impl WorkflowDefinition {
    /// Reads a yaml or json definition file. Unknown extensions are read as json.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::IO {
            path: path.to_path_buf(),
            source,
        })?;

        let file_format = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            _ => FileFormat::Json,
        };

        let definition = Config::builder()
            .add_source(config::File::from_str(&contents, file_format))
            .build()
            .and_then(|config| config.try_deserialize::<DefinitionFile>())
            .map_err(|source| Error::Config {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(definition.workflow)
    }
}
