//! Workflow engine core: definitions, scheduling, and durable recovery.
//!
//! - `definition` -- parsing, validation, and the versioned definition store
//! - `dag` -- cycle detection and ready-set computation
//! - `context` -- template rendering and field extraction
//! - `retry` -- backoff computation and attempt budgets
//! - `breaker` -- per-target circuit breakers
//! - `correlation` -- matching inbound events to waiting steps
//! - `projection` -- folding the state log into a `WorkflowInstance`
//! - `journal` -- single-writer state log per instance
//! - `activity` -- the `remote_call` and `event_wait` primitives
//! - `compensation` -- error handler policies
//! - `executor` -- the scheduler driving instances to a terminal state

pub mod activity;
pub mod breaker;
pub mod compensation;
pub mod context;
pub mod correlation;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod journal;
pub mod projection;
pub mod retry;

pub use breaker::CircuitBreakerRegistry;
pub use correlation::CorrelationManager;
pub use definition::{DefinitionError, DefinitionStore};
pub use executor::{EngineError, InstanceSnapshot, WorkflowEngine};
pub use retry::RetryEvaluator;
