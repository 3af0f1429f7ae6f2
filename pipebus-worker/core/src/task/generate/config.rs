//! Configuration for the generate handler.
//!
//! ```yaml
//! handler:
//!   name: generate
//!   configuration:
//!     source: heartbeat
//!     message: "tick"
//!     interval: 5000
//!     count: 10
//! ```

use crate::properties::{self, Properties};
use std::time::Duration;

/// Registry name of the generate handler.
pub const NAME: &str = "generate";
/// Default delay between two generated payloads.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Typed view of the generate handler properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Source identifier stamped on every payload.
    pub source: String,
    /// Content of every payload.
    pub message: String,
    pub interval: Duration,
    /// Stop after this many payloads. Runs until cancelled when unset.
    pub count: Option<u64>,
}

impl Config {
    /// Declares the generate properties.
    pub fn properties() -> Properties {
        let mut properties = Properties::new(NAME);
        properties
            .add("source", "Source identifier of generated payloads", true)
            .add("message", "Payload content, defaults to 'Hello from: <source>'", false)
            .add("interval", "Milliseconds between payloads", false)
            .add("count", "Number of payloads to generate before stopping", false);
        properties
    }

    /// Reads the config, falling back to `default_interval` when no interval is set.
    pub fn from_properties(
        properties: &Properties,
        default_interval: Option<Duration>,
    ) -> Result<Self, properties::Error> {
        let source: String = properties.require("source")?;
        let message = properties
            .get::<String>("message")?
            .unwrap_or_else(|| format!("Hello from: {source}"));
        let interval = properties
            .get::<u64>("interval")?
            .map(Duration::from_millis)
            .or(default_interval)
            .unwrap_or(DEFAULT_INTERVAL);
        if interval.is_zero() {
            return Err(properties::Error::InvalidValue {
                name: "interval".to_string(),
                reason: "must be greater than zero",
            });
        }

        Ok(Config {
            source,
            message,
            interval,
            count: properties.get("count")?,
        })
    }
}
