//! The byte-moving half of the transport: send one request body, get one response body.
//!
//! [`HttpWire`] posts to `http://<endpoint>/mcp` through a pooled `reqwest` client.
//! [`LoopbackWire`] routes endpoints to in-process [`RpcHandler`]s through the same JSON codec,
//! which lets a whole league run inside one test.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;

use crate::error::TransportError;
use crate::protocol::RPC_PATH;
use crate::rpc_server::{self, RpcHandler};

/// One request/response exchange with an endpoint.
pub trait Wire: Send + Sync {
    /// Post `body` to `endpoint` and return the response body. Must give up after `timeout`.
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        body: String,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, TransportError>>;
}

/// HTTP/1.1 client with a per-host connection pool.
#[derive(Debug, Clone)]
pub struct HttpWire {
    client: reqwest::Client,
}

impl HttpWire {
    /// Idle connections kept per host.
    pub const POOL_MAX_IDLE_PER_HOST: usize = 32;

    /// Client with the default pool settings.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(Self::POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(2))
            .tcp_nodelay(true)
            .build()
            .context("could not build HTTP client")?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() || err.is_body() {
        TransportError::Malformed(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

impl Wire for HttpWire {
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        body: String,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let url = format!("http://{endpoint}{RPC_PATH}");
            let response = self
                .client
                .post(url)
                .timeout(timeout)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Malformed(format!("HTTP status {status}")));
            }
            response.text().await.map_err(classify)
        })
    }
}

/// In-process wire: endpoints are bound to handlers instead of sockets.
///
/// Posting to an unbound endpoint behaves like a refused connection.
#[derive(Default)]
pub struct LoopbackWire {
    routes: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl LoopbackWire {
    /// No endpoint bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `handler` at `endpoint`, replacing any previous binding.
    pub fn bind(&self, endpoint: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), handler);
    }

    /// Stop serving `endpoint`.
    pub fn unbind(&self, endpoint: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    fn route(&self, endpoint: &str) -> Option<Arc<dyn RpcHandler>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }
}

impl Wire for LoopbackWire {
    fn post<'a>(
        &'a self,
        endpoint: &'a str,
        body: String,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let handler = self
                .route(endpoint)
                .ok_or_else(|| TransportError::Connect(format!("{endpoint}: connection refused")))?;
            tokio::time::timeout(timeout, rpc_server::handle_body(handler.as_ref(), &body))
                .await
                .map_err(|_| TransportError::Timeout)
        })
    }
}
