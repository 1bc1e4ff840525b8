//! Serving side of the protocol.
//!
//! Any role (league manager, player) implements [`RpcHandler`]; this module takes care of the
//! envelope: parsing, version check, verb lookup, error objects. [`router`] exposes a handler
//! over HTTP at [`RPC_PATH`], [`handle_body`] is the same pipeline without a socket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, http::header, response::IntoResponse, routing::post, Router};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info};

use crate::error::ProtocolError;
use crate::protocol::{parse_request, Method, RpcRequest, RpcResponse, INTERNAL_ERROR, RPC_PATH};

/// Server-side implementation of the verbs a peer serves.
///
/// Verbs a role does not serve should answer [`ProtocolError::Unsupported`]; unknown verbs
/// never reach the handler.
pub trait RpcHandler: Send + Sync {
    /// Answer one call.
    fn handle(&self, method: Method, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>>;
}

/// Run a parsed request through `handler`.
pub async fn dispatch(handler: &dyn RpcHandler, request: RpcRequest) -> RpcResponse {
    let method = match request.method.parse::<Method>() {
        Ok(method) => method,
        Err(e) => {
            debug!(method = %request.method, "unknown method");
            return RpcResponse::failure(request.id, e);
        }
    };
    match handler.handle(method, request.params).await {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(e) => {
            debug!(%method, error = %e, "call rejected");
            RpcResponse::failure(request.id, e)
        }
    }
}

/// Full pipeline from raw request body to raw response body.
pub async fn handle_body(handler: &dyn RpcHandler, body: &str) -> String {
    let response = match parse_request(body) {
        Ok(request) => dispatch(handler, request).await,
        Err((id, e)) => RpcResponse::failure(id.unwrap_or_default(), e),
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        json!({
            "id": response.id,
            "error": { "code": INTERNAL_ERROR, "message": e.to_string() },
        })
        .to_string()
    })
}

async fn serve_rpc(
    State(handler): State<Arc<dyn RpcHandler>>,
    body: String,
) -> impl IntoResponse {
    let response = handle_body(handler.as_ref(), &body).await;
    ([(header::CONTENT_TYPE, "application/json")], response)
}

/// Axum router serving `handler` at [`RPC_PATH`].
pub fn router(handler: Arc<dyn RpcHandler>) -> Router {
    Router::new()
        .route(RPC_PATH, post(serve_rpc))
        .with_state(handler)
}

/// A running HTTP server. Dropping it stops the server.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind `addr` (e.g. `127.0.0.1:0`) and serve `handler` in a background task.
    pub async fn bind(addr: &str, handler: Arc<dyn RpcHandler>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        let app = router(handler);
        info!(%local_addr, "serving RPC");
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                error!(%local_addr, error = %e, "RPC server failed");
            }
        });
        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` to register with the league.
    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod rpc_server_tests {
    use super::*;
    use crate::protocol::{HealthStatus, METHOD_NOT_FOUND, UNSUPPORTED_METHOD};

    struct HealthOnly;

    impl RpcHandler for HealthOnly {
        fn handle(&self, method: Method, _params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
            Box::pin(async move {
                match method {
                    Method::HealthCheck => crate::protocol::encode(&HealthStatus::ok()),
                    other => Err(ProtocolError::Unsupported(other.to_string())),
                }
            })
        }
    }

    async fn call(body: &str) -> Value {
        serde_json::from_str(&handle_body(&HealthOnly, body).await).unwrap()
    }

    #[tokio::test]
    async fn known_verb_is_served() {
        let v = call(r#"{"version":"2.0","method":"health_check","params":{},"id":"a"}"#).await;
        assert_eq!(v["id"], "a");
        assert_eq!(v["version"], "2.0");
        assert_eq!(v["result"]["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_and_unsupported_verbs() {
        let v = call(r#"{"version":"2.0","method":"dance","params":{},"id":"b"}"#).await;
        assert_eq!(v["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(v["id"], "b");

        let v = call(r#"{"version":"2.0","method":"request_move","params":{},"id":"c"}"#).await;
        assert_eq!(v["error"]["code"], UNSUPPORTED_METHOD);
    }

    #[tokio::test]
    async fn http_round_trip() {
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(HealthOnly)).await.unwrap();
        let url = format!("http://{}{RPC_PATH}", server.endpoint());
        let body = serde_json::to_string(&RpcRequest::new(Method::HealthCheck, json!({}))).unwrap();
        let response: Value = reqwest::Client::new()
            .post(url)
            .body(body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["result"]["status"], "ok");
        server.shutdown().await;
    }
}
