//! Explicit registry mapping handler names to factories.
//!
//! Nothing registers itself. The application owns a registry, fills it at
//! construction and resolves handler names from workflow definitions against it.

use super::handler::Handler;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors that can occur while registering or resolving handlers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Handler '{}' is already registered", _0)]
    DuplicateHandler(String),
    #[error("Unknown handler: {}", _0)]
    UnknownHandler(String),
}

/// Creates a fresh, unconfigured handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled `generate` and `log` handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            super::generate::config::NAME.to_string(),
            Arc::new(|| Box::new(super::generate::handler::Generate::new()) as Box<dyn Handler>),
        );
        registry.factories.insert(
            super::log::handler::NAME.to_string(),
            Arc::new(|| Box::new(super::log::handler::Log::new()) as Box<dyn Handler>),
        );
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), Error>
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateHandler(name));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Handler>, Error> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownHandler(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::log::handler::Log;

    #[test]
    fn test_builtins() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["generate", "log"]);

        let handler = registry.create("generate").unwrap();
        assert_eq!(handler.name(), "generate");
        assert!(handler.subscriptionless());
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = HandlerRegistry::with_builtins();
        let result = registry.register("log", || Box::new(Log::new()));
        assert!(matches!(result, Err(Error::DuplicateHandler(name)) if name == "log"));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.create("regex"),
            Err(Error::UnknownHandler(name)) if name == "regex"
        ));
    }

    #[test]
    fn test_factory_returns_fresh_instances() {
        let mut registry = HandlerRegistry::new();
        registry.register("custom", || Box::new(Log::new())).unwrap();

        let mut first = registry.create("custom").unwrap();
        first.configuration_mut().set("label", "changed").unwrap();
        let second = registry.create("custom").unwrap();

        assert_eq!(second.configuration().get::<String>("label").unwrap(), None);
    }
}
