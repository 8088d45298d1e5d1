//! Ports to the outside world: service discovery and remote calls.

pub mod registry;
pub mod transport;

pub use registry::{RegistryError, ServiceRegistry, StaticServiceRegistry};
pub use transport::{
    BoxTransport, RemoteRequest, RemoteResponse, RemoteTransport, RemoteTransportDyn,
    TransportError,
};
