//! Workflow engine and repository trait definitions for Conflux.
//!
//! This crate defines the "ports" (repository, transport and registry traits)
//! that the infrastructure layer implements, plus the engine itself. It
//! depends only on `conflux-types`, never on `conflux-infra` or any
//! database/IO crate.

pub mod event;
pub mod remote;
pub mod repository;
pub mod workflow;
