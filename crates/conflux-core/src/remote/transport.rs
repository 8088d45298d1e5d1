//! Outbound call port and its object-safe wrapper.
//!
//! Follows the same blanket-impl pattern used for every RPITIT port:
//! 1. `RemoteTransport` uses `impl Future` returns (no async_trait).
//! 2. `RemoteTransportDyn` is the object-safe twin with boxed futures.
//! 3. `BoxTransport` wraps `Arc<dyn RemoteTransportDyn>` and delegates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use conflux_types::error::StepFailure;
use serde_json::Value;

/// A fully rendered call to a downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Logical target name (breaker and admission key).
    pub target: String,
    /// Address resolved from the service registry.
    pub address: String,
    pub method: String,
    pub path: String,
    pub body: Value,
    /// Sent with the request so the target can deduplicate re-issued calls.
    pub idempotency_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

/// Transport-level failure of a call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("target returned status {status}")]
    Status { status: u16, body: Value },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Map onto the step failure taxonomy.
    ///
    /// 5xx, 408 and 429 are transient; other statuses are permanent.
    pub fn into_failure(self, target: &str) -> StepFailure {
        let message = format!("{target}: {self}");
        match self {
            TransportError::Connect(_) => StepFailure::transient(message),
            TransportError::Timeout => StepFailure::timeout(message),
            TransportError::Status { status, .. }
                if status >= 500 || status == 408 || status == 429 =>
            {
                StepFailure::transient(message)
            }
            TransportError::Status { .. }
            | TransportError::InvalidRequest(_)
            | TransportError::Decode(_) => StepFailure::permanent(message),
        }
    }
}

/// Performs remote calls. Implemented over HTTP in conflux-infra.
pub trait RemoteTransport: Send + Sync {
    fn call(
        &self,
        request: &RemoteRequest,
    ) -> impl Future<Output = Result<RemoteResponse, TransportError>> + Send;
}

/// Object-safe version of [`RemoteTransport`] with boxed futures.
pub trait RemoteTransportDyn: Send + Sync {
    fn call_boxed<'a>(
        &'a self,
        request: &'a RemoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteResponse, TransportError>> + Send + 'a>>;
}

impl<T: RemoteTransport> RemoteTransportDyn for T {
    fn call_boxed<'a>(
        &'a self,
        request: &'a RemoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteResponse, TransportError>> + Send + 'a>> {
        Box::pin(self.call(request))
    }
}

/// Type-erased transport chosen at startup.
#[derive(Clone)]
pub struct BoxTransport {
    inner: Arc<dyn RemoteTransportDyn>,
}

impl BoxTransport {
    pub fn new<T: RemoteTransport + 'static>(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
        }
    }

    pub async fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
        self.inner.call_boxed(request).await
    }
}

impl std::fmt::Debug for BoxTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::error::FailureKind;
    use serde_json::json;

    struct Echo;

    impl RemoteTransport for Echo {
        async fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
            Ok(RemoteResponse {
                status: 200,
                body: request.body.clone(),
            })
        }
    }

    #[tokio::test]
    async fn box_transport_delegates() {
        let transport = BoxTransport::new(Echo);
        let request = RemoteRequest {
            target: "echo".to_string(),
            address: "http://echo".to_string(),
            method: "POST".to_string(),
            path: "/".to_string(),
            body: json!({"hello": "world"}),
            idempotency_key: "k".to_string(),
            timeout: Duration::from_secs(1),
        };
        let response = transport.call(&request).await.unwrap();
        assert_eq!(response.body, json!({"hello": "world"}));
    }

    #[test]
    fn status_classification() {
        let kind = |status| {
            TransportError::Status {
                status,
                body: Value::Null,
            }
            .into_failure("svc")
            .kind
        };
        assert_eq!(kind(503), FailureKind::Transient);
        assert_eq!(kind(429), FailureKind::Transient);
        assert_eq!(kind(404), FailureKind::Permanent);
        assert_eq!(kind(422), FailureKind::Permanent);
        assert_eq!(
            TransportError::Timeout.into_failure("svc").kind,
            FailureKind::Timeout
        );
        assert_eq!(
            TransportError::Connect("refused".into()).into_failure("svc").kind,
            FailureKind::Transient
        );
    }
}
