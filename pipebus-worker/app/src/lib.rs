//! Workflow composition and application supervision for pipebus.
//!
//! Workflows chain processors into ordered pipelines; an application owns the
//! workflows sharing one engine and rebuilds them from definition files.

/// Application lifecycle driven by configuration.
pub mod app;
/// Top-level owner of workflows.
pub mod application;
/// Configuration structures and loading.
pub mod config;
/// Persisted workflow definitions.
pub mod definition;
/// Ordered processor pipelines.
pub mod workflow;
