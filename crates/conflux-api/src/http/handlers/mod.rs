//! HTTP request handlers for the Trigger API.

pub mod definition;
pub mod event;
pub mod instance;
