//! Infrastructure layer for Conflux.
//!
//! Implements the ports defined in `conflux-core`: SQLite persistence for
//! definitions, state logs and breakers, the HTTP remote-call transport, and
//! loading the engine configuration from the data directory.

pub mod config;
pub mod remote;
pub mod sqlite;
