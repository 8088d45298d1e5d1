//! Shared domain types for Conflux.
//!
//! Workflow definitions, the state log and its instance projection, events,
//! circuit breaker snapshots, configuration, and the error types shared by
//! the engine and its adapters.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
