//! HttpTransport -- [`RemoteTransport`] over HTTP/JSON.
//!
//! Each call becomes `METHOD {address}{path}` with a JSON body and an
//! `Idempotency-Key` header carrying the step execution id, so a target can
//! deduplicate calls that are re-issued after a crash. Any non-2xx status is
//! reported as `TransportError::Status`; classification into transient and
//! permanent failures happens in the engine.

use std::time::Duration;

use conflux_core::remote::{RemoteRequest, RemoteResponse, RemoteTransport, TransportError};
use conflux_types::config::HttpConfig;
use reqwest::Method;
use serde_json::Value;

/// Header carrying the step execution id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a shared connection pool.
    ///
    /// Per-request timeouts come from each `RemoteRequest`; only the connect
    /// timeout is fixed here.
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

impl RemoteTransport for HttpTransport {
    async fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                TransportError::InvalidRequest(format!("bad method '{}'", request.method))
            })?;
        let url = format!("{}{}", request.address, request.path);

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .timeout(request.timeout)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key);
        if !(request.body.is_null() && matches!(method, Method::GET | Method::DELETE)) {
            builder = builder.json(&request.body);
        }

        tracing::debug!(
            target_name = %request.target,
            method = %method,
            url = %url,
            idempotency_key = %request.idempotency_key,
            "sending remote call"
        );

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| classify(&e))?;
        let body = parse_body(&text);

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(RemoteResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn classify(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

/// Empty bodies become `null`; non-JSON text is kept as a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn request(address: &str, path: &str, body: Value) -> RemoteRequest {
        RemoteRequest {
            target: "agents".to_string(),
            address: address.to_string(),
            method: "post".to_string(),
            path: path.to_string(),
            body,
            idempotency_key: "inst:assign:1".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(&HttpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn sends_json_with_idempotency_key() {
        let router = Router::new().route(
            "/assign",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let key = headers
                    .get(IDEMPOTENCY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({ "key": key, "body": body }))
            }),
        );
        let address = serve(router).await;

        let response = transport()
            .call(&request(&address, "/assign", json!({"task": "t1"})))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["key"], "inst:assign:1");
        assert_eq!(response.body["body"], json!({"task": "t1"}));
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let router = Router::new()
            .route(
                "/busy",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
            )
            .route(
                "/bad",
                post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"error": "no"}))) }),
            );
        let address = serve(router).await;

        let err = transport()
            .call(&request(&address, "/busy", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Status { status: 503, ref body } if body == "try later"
        ));

        let err = transport()
            .call(&request(&address, "/bad", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 422, .. }));
    }

    #[tokio::test]
    async fn slow_targets_time_out() {
        let router = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let address = serve(router).await;

        let mut slow = request(&address, "/slow", json!({}));
        slow.timeout = Duration::from_millis(100);
        let err = transport().call(&slow).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn unreachable_targets_are_connect_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = transport()
            .call(&request(&address, "/x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[test]
    fn body_parsing() {
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_body("plain"), json!("plain"));
    }
}
