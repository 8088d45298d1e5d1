//! Outbound adapters for the engine's remote ports.

pub mod http;

pub use http::HttpTransport;
