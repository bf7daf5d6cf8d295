//! HTTP/JSON gateway in front of the primary gRPC server.
//!
//! The gateway holds one gRPC channel to the primary server and translates
//! each JSON route into the matching RPC. Authentication, validation and rate
//! limiting are left to the primary server's interceptor chain.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, Endpoint};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tls::TlsCredentials;

pub mod cors;
pub mod error;
pub mod handlers;
pub mod json;

pub use error::{ErrorBody, GatewayError};
pub use handlers::GatewayState;

/// Connect timeout when dialing the primary server.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Time a client gets to send its request headers.
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the primary server, over TLS when `tls` is given.
///
/// # Errors
/// Returns [`Error::Dial`] if no connection is established within [`DIAL_TIMEOUT`].
pub async fn dial(addr: SocketAddr, tls: Option<&TlsCredentials>) -> Result<Channel> {
    let dial_err = |reason: String| Error::Dial { addr, reason };

    let scheme = if tls.is_some() { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
        .map_err(|e| dial_err(e.to_string()))?
        .connect_timeout(DIAL_TIMEOUT);
    if let Some(creds) = tls {
        debug!(%addr, server_name = creds.server_name(), "dialing primary server over tls");
        endpoint = endpoint
            .tls_config(creds.client_tls_config())
            .map_err(|e| dial_err(e.to_string()))?;
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| dial_err(e.to_string()))?;
    debug!(%addr, tls = tls.is_some(), "gateway connected to primary server");
    Ok(channel)
}

/// Builds the route table over a connected channel.
pub fn router(channel: Channel, cors: CorsLayer) -> Router {
    Router::new()
        .route(
            "/v1/tenants/{tenant_id}/permissions/check",
            post(handlers::check),
        )
        .route(
            "/v1/tenants/{tenant_id}/permissions/lookup-entity",
            post(handlers::lookup_entity),
        )
        .route(
            "/v1/tenants/{tenant_id}/schemas/write",
            post(handlers::schema_write),
        )
        .route(
            "/v1/tenants/{tenant_id}/schemas/read",
            post(handlers::schema_read),
        )
        .route(
            "/v1/tenants/{tenant_id}/data/write",
            post(handlers::data_write),
        )
        .route(
            "/v1/tenants/{tenant_id}/data/relationships/read",
            post(handlers::read_relationships),
        )
        .route(
            "/v1/tenants/{tenant_id}/data/delete",
            post(handlers::data_delete),
        )
        .route("/v1/tenants/create", post(handlers::tenant_create))
        .route("/v1/tenants/list", post(handlers::tenant_list))
        .route("/v1/tenants/{tenant_id}", delete(handlers::tenant_delete))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(GatewayState::new(channel))
}

/// Serves `router` on `listener` until `shutdown` fires.
///
/// On shutdown the listener is closed at once, idle connections are closed,
/// and in-flight requests are allowed to finish. The caller bounds how long
/// that may take.
///
/// # Errors
/// Only returns errors raised before the accept loop starts.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    let local = listener.local_addr()?;

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "gateway accept failed");
                    continue;
                }
            },
        };

        let router = router.clone();
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => serve_connection(TokioIo::new(tls), router, shutdown).await,
                    Err(e) => debug!(%peer, error = %e, "tls handshake failed"),
                },
                None => serve_connection(TokioIo::new(stream), router, shutdown).await,
            }
        });
    }

    drop(listener);
    info!(addr = %local, connections = tracker.len(), "gateway draining connections");
    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn serve_connection<I>(io: TokioIo<I>, router: Router, shutdown: CancellationToken)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT);

    let service = TowerToHyperService::new(router);
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(error = %e, "gateway connection closed with error");
                }
                break;
            }
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
