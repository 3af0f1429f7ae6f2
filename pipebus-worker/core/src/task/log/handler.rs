//! Pass-through handler that logs every payload it receives.

use crate::payload::Payload;
use crate::properties::Properties;
use crate::task::context::TaskContext;
use crate::task::handler::{Handler, Outputs};
use crate::BoxError;
use async_trait::async_trait;
use tracing::info;

/// Registry name of the log handler.
pub const NAME: &str = "log";

/// Logs each payload at info level and forwards it unchanged.
#[derive(Debug, Clone)]
pub struct Log {
    properties: Properties,
}

impl Log {
    pub fn new() -> Self {
        let mut properties = Properties::new(NAME);
        properties.add("label", "Label prepended to every log line", false);
        Log { properties }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Log {
    fn name(&self) -> &str {
        NAME
    }

    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: Option<Payload>,
        outputs: &Outputs,
    ) -> Result<(), BoxError> {
        let Some(payload) = payload else {
            return Ok(());
        };

        let label = self
            .properties
            .get::<String>("label")?
            .unwrap_or_else(|| ctx.processor_name.clone());
        info!(label = %label, source = %payload.source, "{}", payload.content_str());

        outputs.emit(payload).await;
        Ok(())
    }

    fn configuration(&self) -> &Properties {
        &self.properties
    }

    fn configuration_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryEngineBuilder;
    use crate::bus::Engine;
    use crate::task::context::TaskContextBuilder;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_forwards_payload_unchanged() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngineBuilder::new().build());
        let mut pipe = engine.subscribe("logged", "t", 4).await.unwrap();
        let outputs = Outputs::new("log", Arc::clone(&engine), vec!["logged".to_string()]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = TaskContextBuilder::new()
            .processor_id(2)
            .processor_name("log")
            .cancellation(CancellationToken::new())
            .failures(tx)
            .build()
            .unwrap();

        let payload = Payload::new("line", "reader");
        Log::new()
            .handle(&ctx, Some(payload.clone()), &outputs)
            .await
            .unwrap();

        assert_eq!(pipe.try_recv().unwrap(), payload);
    }
}
