//! Self-driving handler that emits a payload on every interval tick.

use super::config::{Config, NAME};
use crate::payload::Payload;
use crate::properties::{self, Properties};
use crate::task::context::TaskContext;
use crate::task::handler::{Handler, Outputs};
use crate::BoxError;
use async_trait::async_trait;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Generates payloads until cancelled or the configured count is reached.
#[derive(Debug, Clone)]
pub struct Generate {
    properties: Properties,
}

impl Generate {
    pub fn new() -> Self {
        Generate {
            properties: Config::properties(),
        }
    }
}

impl Default for Generate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Generate {
    fn name(&self) -> &str {
        NAME
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        _payload: Option<Payload>,
        outputs: &Outputs,
    ) -> Result<(), BoxError> {
        let config = Config::from_properties(&self.properties, ctx.interval)?;

        // First payload goes out one interval after start.
        let mut ticker = time::interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut generated = 0u64;
        while config.count.map_or(true, |count| generated < count) {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            outputs
                .emit(Payload::new(config.message.clone(), config.source.clone()))
                .await;
            generated += 1;
        }

        debug!(processor = %ctx.processor_name, generated, "Generation finished");
        Ok(())
    }

    fn configuration(&self) -> &Properties {
        &self.properties
    }

    fn configuration_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Also rejects values `handle` could not run with, such as a zero interval.
    fn validate_configuration(&self) -> Result<(), properties::Error> {
        self.properties.validate()?;
        Config::from_properties(&self.properties, None).map(|_| ())
    }

    fn subscriptionless(&self) -> bool {
        true
    }
}
