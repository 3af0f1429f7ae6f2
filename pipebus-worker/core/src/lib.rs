//! pipebus core library providing the message bus and the processor execution model.
//!
//! This crate contains the payload type, the publish/subscribe engine abstraction
//! with its in-process implementation, the handler contract, and the processor
//! lifecycle that binds a handler to topics.

/// Topic-based publish/subscribe engines.
pub mod bus;
/// Client connection trait for out-of-process backends.
pub mod client;
/// Counter-style metric provider contract.
pub mod metrics;
/// Unit of data exchanged between processors.
pub mod payload;
/// Typed key-value configuration for handlers.
pub mod properties;
/// Retry configuration with exponential backoff.
pub mod retry;
/// Processor execution framework with handler trait, context and lifecycle.
pub mod task {
    /// Runtime context handed to every handler invocation.
    pub mod context;
    /// Failure records and sinks.
    pub mod failure;
    /// Self-driving payload generator.
    pub mod generate {
        /// Configuration for the generate handler.
        pub mod config;
        /// Handler implementation for payload generation.
        pub mod handler;
    }
    /// Handler contract and output publishing.
    pub mod handler;
    /// Pass-through handler that logs every payload.
    pub mod log {
        /// Handler implementation for payload logging.
        pub mod handler;
    }
    /// Processor lifecycle and subscription wiring.
    pub mod processor;
    /// Explicit handler registry.
    pub mod registry;
    /// Base runner trait for long-running services.
    pub mod runner;
}

/// Boxed error used at dynamic boundaries such as handlers and backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
