//! HTTP surface of the tunnel server
//!
//! | Route | Method | Operation |
//! |---|---|---|
//! | `/connect` | POST | open (JSON [`ConnectionConfig`] body) |
//! | `/write` | POST | write (`X-SOH-ID` header, raw or Base64 body) |
//! | `/read` | GET | read (`X-SOH-ID` header) |
//! | `/close` | GET | close (`X-SOH-ID` header) |
//! | `/clean` | GET | close every tunnel |
//! | `/` | GET | fixed info text |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sohtunnel_core::{ConnectionConfig, HEADER_CONNECTION_ID, SERVER_INFO};

use crate::handler::TunnelHandler;
use crate::{Result, ServerError};

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Tunnel call failed: {}", self);
        } else {
            debug!("Tunnel call rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

fn connection_id(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(HEADER_CONNECTION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(ServerError::MissingConnectionId)
}

async fn info_route() -> &'static str {
    SERVER_INFO
}

async fn connect_route(
    State(handler): State<Arc<TunnelHandler>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(config): Json<ConnectionConfig>,
) -> Result<String> {
    handler.open(config, addr.ip()).await
}

async fn write_route(
    State(handler): State<Arc<TunnelHandler>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<()> {
    let id = connection_id(&headers)?;
    handler.write(id, addr.ip(), &body).await
}

async fn read_route(
    State(handler): State<Arc<TunnelHandler>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Vec<u8>> {
    let id = connection_id(&headers)?;
    handler.read(id, addr.ip()).await
}

async fn close_route(
    State(handler): State<Arc<TunnelHandler>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<()> {
    let id = connection_id(&headers)?;
    handler.close(id, addr.ip()).await
}

async fn clean_route(State(handler): State<Arc<TunnelHandler>>) -> String {
    handler.clean().await.to_string()
}

/// Build the tunnel router.
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`
/// so handlers can see the caller's address.
pub fn router(handler: Arc<TunnelHandler>) -> Router {
    Router::new()
        .route("/", get(info_route))
        .route("/connect", post(connect_route))
        .route("/write", post(write_route))
        .route("/read", get(read_route))
        .route("/close", get(close_route))
        .route("/clean", get(clean_route))
        .with_state(handler)
}

/// HTTP tunnel server
pub struct TunnelServer {
    listen_addr: SocketAddr,
    handler: Arc<TunnelHandler>,
    shutdown: CancellationToken,
    /// Handle for the serve task
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TunnelServer {
    pub fn new(listen_addr: SocketAddr, handler: Arc<TunnelHandler>) -> Self {
        Self {
            listen_addr,
            handler,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Bind and start serving.
    ///
    /// Returns once the listener is bound; the server runs in a background task.
    pub async fn start(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let actual_addr = listener.local_addr()?;
        info!("Tunnel server listening on {}", actual_addr);
        self.listen_addr = actual_addr;

        let app = router(self.handler.clone());
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;

            if let Err(e) = result {
                error!("Tunnel server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop accepting calls and close every open tunnel
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        let report = self.handler.clean().await;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        info!("Tunnel server stopped, {}", report);
    }

    /// Stop the server without waiting
    pub fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Tunnel server stopped");
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn handler(&self) -> &Arc<TunnelHandler> {
        &self.handler
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.stop();
    }
}
