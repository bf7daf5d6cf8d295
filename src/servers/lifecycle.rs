//! Startup and shutdown of the server set.
//!
//! [`ServerSet::start`] walks `Initializing → Binding → Serving`. Every fallible
//! setup step runs before any socket is opened, and a failure while binding
//! releases whatever was already bound. [`ServerSet::shutdown`] stops the gateway
//! first with a bounded grace period, then both gRPC servers, then the profiler.

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Container, RpcServer};
use crate::authn;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway;
use crate::invoke::Invoker;
use crate::middleware::{AuthInterceptor, InterceptorChain, RateLimiter};
use crate::profiler;
use crate::tls::{self, TlsCredentials};

const EVENT_CAPACITY: usize = 64;

/// The four listeners a process may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKind {
    /// Full gRPC API.
    Primary,
    /// Permission-only gRPC endpoint for peer nodes.
    Invoker,
    /// HTTP/JSON bridge to the primary server.
    Gateway,
    /// Diagnostics sidecar.
    Profiler,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerKind::Primary => "primary",
            ServerKind::Invoker => "invoker",
            ServerKind::Gateway => "gateway",
            ServerKind::Profiler => "profiler",
        })
    }
}

/// Where the server set is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Building chains, authentication and TLS material.
    Initializing,
    /// Opening listeners.
    Binding,
    /// All configured servers are running.
    Serving,
    /// Servers are being stopped.
    ShuttingDown,
    /// Every server has been stopped.
    Stopped,
    /// Startup failed; nothing is left running.
    Failed,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initializing, Binding)
                | (Initializing, Failed)
                | (Binding, Serving)
                | (Binding, Failed)
                | (Serving, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }
}

/// Published on every server start, failure, stop request and stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A server is accepting connections.
    Started {
        /// Which server.
        server: ServerKind,
        /// Bound address.
        addr: SocketAddr,
    },
    /// A server's serve loop ended with an error.
    Failed {
        /// Which server.
        server: ServerKind,
        /// What went wrong.
        error: String,
    },
    /// A server was asked to stop.
    Stopping {
        /// Which server.
        server: ServerKind,
    },
    /// A server's serve loop ended cleanly.
    Stopped {
        /// Which server.
        server: ServerKind,
    },
}

struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    fn transition(&mut self, next: LifecycleState) {
        if self.state.can_transition_to(next) {
            debug!(from = ?self.state, to = ?next, "lifecycle transition");
            self.state = next;
        } else {
            warn!(from = ?self.state, to = ?next, "ignoring invalid lifecycle transition");
        }
    }
}

/// A running server: its address, stop signal and serve task.
struct ServerTask {
    kind: ServerKind,
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<std::result::Result<(), String>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerTask {
    fn spawn<F, Fut>(
        kind: ServerKind,
        addr: SocketAddr,
        events: &broadcast::Sender<ServerEvent>,
        serve: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let fut = serve(cancel.clone());
        let tx = events.clone();

        info!(server = %kind, %addr, "server started");
        let _ = events.send(ServerEvent::Started { server: kind, addr });

        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => {
                    info!(server = %kind, "server stopped");
                    let _ = tx.send(ServerEvent::Stopped { server: kind });
                    Ok(())
                }
                Err(e) => {
                    error!(server = %kind, error = %e, "server failed");
                    let _ = tx.send(ServerEvent::Failed {
                        server: kind,
                        error: e.to_string(),
                    });
                    Err(e.to_string())
                }
            }
        });

        Self {
            kind,
            addr,
            cancel,
            handle,
            events: events.clone(),
        }
    }

    /// Asks the server to drain and waits for it, at most `bound` if given.
    async fn stop(mut self, bound: Option<Duration>) -> std::result::Result<(), String> {
        let kind = self.kind;
        let _ = self.events.send(ServerEvent::Stopping { server: kind });
        self.cancel.cancel();

        let joined = match bound {
            Some(bound) => match tokio::time::timeout(bound, &mut self.handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.handle.abort();
                    warn!(server = %kind, ?bound, "server did not stop in time");
                    return Err(format!("{kind} server did not stop within {bound:?}"));
                }
            },
            None => (&mut self.handle).await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{kind} server: {e}")),
            Err(e) => Err(format!("{kind} server task: {e}")),
        }
    }

    fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Handle to every running server of a process.
///
/// Dropping the set without calling [`ServerSet::shutdown`] cancels every
/// server without waiting for it.
pub struct ServerSet {
    lifecycle: Lifecycle,
    primary: Option<ServerTask>,
    invoker: Option<ServerTask>,
    gateway: Option<ServerTask>,
    profiler: Option<ServerTask>,
    primary_addr: SocketAddr,
    invoker_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    profiler_addr: Option<SocketAddr>,
    limiter: RateLimiter,
    events: broadcast::Sender<ServerEvent>,
    http_timeout: Duration,
    rpc_grace: Option<Duration>,
}

impl ServerSet {
    pub(crate) async fn start(
        container: &Container,
        config: &Config,
        local_invoker: Arc<dyn Invoker>,
    ) -> Result<Self> {
        let mut lifecycle = Lifecycle {
            state: LifecycleState::Initializing,
        };

        let prepared = match prepare(container, config, local_invoker).await {
            Ok(prepared) => prepared,
            Err(e) => {
                lifecycle.transition(LifecycleState::Failed);
                error!(error = %e, "startup failed before binding");
                return Err(e);
            }
        };

        lifecycle.transition(LifecycleState::Binding);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        match launch(prepared, config, &events).await {
            Ok(mut set) => {
                set.lifecycle.transition(LifecycleState::Serving);
                Ok(set)
            }
            Err(e) => {
                lifecycle.transition(LifecycleState::Failed);
                error!(error = %e, "startup failed");
                Err(e)
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state
    }

    /// Bound address of the primary gRPC server.
    pub fn primary_addr(&self) -> SocketAddr {
        self.primary_addr
    }

    /// Bound address of the invoker gRPC server.
    pub fn invoker_addr(&self) -> SocketAddr {
        self.invoker_addr
    }

    /// Bound address of the HTTP gateway, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound address of the profiler, if it is running.
    pub fn profiler_addr(&self) -> Option<SocketAddr> {
        self.profiler_addr
    }

    /// Limiter shared by both gRPC servers.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Receives every server event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stops every server: gateway, then both gRPC servers, then the profiler.
    ///
    /// Each step runs even if an earlier one failed. Calling this again after
    /// the set has stopped does nothing.
    ///
    /// # Errors
    /// Returns [`Error::Shutdown`] naming every step that failed.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.lifecycle.state == LifecycleState::Stopped {
            debug!("server set already stopped");
            return Ok(());
        }
        self.lifecycle.transition(LifecycleState::ShuttingDown);
        info!("shutting down servers");

        let mut failures = Vec::new();

        if let Some(gateway) = self.gateway.take() {
            if let Err(e) = gateway.stop(Some(self.http_timeout)).await {
                error!(error = %e, "gateway shutdown failed");
                failures.push(e);
            }
        }

        let primary = self.primary.take();
        let invoker = self.invoker.take();
        let grace = self.rpc_grace;
        let (primary, invoker) = join(
            async move {
                match primary {
                    Some(task) => task.stop(grace).await,
                    None => Ok(()),
                }
            },
            async move {
                match invoker {
                    Some(task) => task.stop(grace).await,
                    None => Ok(()),
                }
            },
        )
        .await;
        for result in [primary, invoker] {
            if let Err(e) = result {
                error!(error = %e, "rpc server shutdown failed");
                failures.push(e);
            }
        }

        if let Some(profiler) = self.profiler.take() {
            if let Err(e) = profiler.stop(Some(self.http_timeout)).await {
                warn!(error = %e, "profiler shutdown failed");
                failures.push(e);
            }
        }

        self.lifecycle.transition(LifecycleState::Stopped);
        if failures.is_empty() {
            info!("all servers stopped");
            Ok(())
        } else {
            Err(Error::Shutdown(failures))
        }
    }
}

impl Drop for ServerSet {
    fn drop(&mut self) {
        for task in [
            self.gateway.take(),
            self.primary.take(),
            self.invoker.take(),
            self.profiler.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.cancel.cancel();
        }
    }
}

/// Everything built during `Initializing`, ready to be bound.
struct Prepared {
    limiter: RateLimiter,
    primary: RpcServer,
    invoker: RpcServer,
    grpc_tls: Option<TlsCredentials>,
    http_tls: Option<TlsCredentials>,
    cors: tower_http::cors::CorsLayer,
}

async fn prepare(
    container: &Container,
    config: &Config,
    local_invoker: Arc<dyn Invoker>,
) -> Result<Prepared> {
    config.validate().map_err(Error::Config)?;
    tls::install_crypto_provider();

    let limiter = RateLimiter::new(config.server.rate_limit);
    let auth = authn::select(&config.authn).await?.map(AuthInterceptor::new);
    let chain = InterceptorChain::compose(limiter.clone(), auth);
    debug!(stages = ?chain.unary_stages(), "interceptor chain composed");

    let grpc_tls = TlsCredentials::load(&config.server.grpc.tls).await?;
    let (http_tls, cors) = if config.server.http.enabled {
        (
            TlsCredentials::load(&config.server.http.tls).await?,
            gateway::cors::layer(&config.server.http)?,
        )
    } else {
        (None, tower_http::cors::CorsLayer::new())
    };

    let primary = RpcServer::primary(container, chain.clone(), grpc_tls.as_ref()).await?;
    let invoker = RpcServer::invoker(local_invoker, chain, grpc_tls.as_ref()).await?;

    Ok(Prepared {
        limiter,
        primary,
        invoker,
        grpc_tls,
        http_tls,
        cors,
    })
}

async fn bind(kind: ServerKind, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind {
            server: kind,
            addr,
            source,
        })
}

async fn launch(
    prepared: Prepared,
    config: &Config,
    events: &broadcast::Sender<ServerEvent>,
) -> Result<ServerSet> {
    let Prepared {
        limiter,
        primary,
        invoker,
        grpc_tls,
        http_tls,
        cors,
    } = prepared;

    let primary_listener = bind(
        ServerKind::Primary,
        config.bind_addr(config.server.grpc.port)?,
    )
    .await?;
    let invoker_listener = bind(
        ServerKind::Invoker,
        config.bind_addr(config.distributed.port)?,
    )
    .await?;
    let primary_addr = primary_listener.local_addr()?;
    let invoker_addr = invoker_listener.local_addr()?;

    let primary_task = ServerTask::spawn(ServerKind::Primary, primary_addr, events, |cancel| {
        primary.serve(primary_listener, cancel)
    });
    let invoker_task = ServerTask::spawn(ServerKind::Invoker, invoker_addr, events, |cancel| {
        invoker.serve(invoker_listener, cancel)
    });

    let mut set = ServerSet {
        lifecycle: Lifecycle {
            state: LifecycleState::Binding,
        },
        primary: Some(primary_task),
        invoker: Some(invoker_task),
        gateway: None,
        profiler: None,
        primary_addr,
        invoker_addr,
        http_addr: None,
        profiler_addr: None,
        limiter,
        events: events.clone(),
        http_timeout: config.server.shutdown.http_timeout(),
        rpc_grace: config.server.shutdown.rpc_grace_period(),
    };

    if config.server.http.enabled {
        let gateway = start_gateway(
            config,
            primary_addr,
            grpc_tls.as_ref(),
            http_tls.as_ref(),
            cors,
            events,
        )
        .await;
        match gateway {
            Ok(task) => {
                set.http_addr = Some(task.addr);
                set.gateway = Some(task);
            }
            Err(e) => {
                for task in [set.primary.take(), set.invoker.take()].into_iter().flatten() {
                    task.abort();
                }
                return Err(e);
            }
        }
    }

    if config.profiler.enabled {
        match config.bind_addr(config.profiler.port) {
            Ok(addr) => match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    let task = ServerTask::spawn(ServerKind::Profiler, addr, events, |cancel| {
                        profiler::serve(listener, cancel)
                    });
                    set.profiler_addr = Some(addr);
                    set.profiler = Some(task);
                }
                Err(e) => warn!(%addr, error = %e, "profiler bind failed, continuing without it"),
            },
            Err(e) => warn!(error = %e, "profiler address invalid, continuing without it"),
        }
    }

    Ok(set)
}

async fn start_gateway(
    config: &Config,
    primary_addr: SocketAddr,
    grpc_tls: Option<&TlsCredentials>,
    http_tls: Option<&TlsCredentials>,
    cors: tower_http::cors::CorsLayer,
    events: &broadcast::Sender<ServerEvent>,
) -> Result<ServerTask> {
    // The primary may listen on every interface; the gateway always dials loopback.
    let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), primary_addr.port());
    let channel = gateway::dial(target, grpc_tls).await?;
    let acceptor = http_tls.map(TlsCredentials::acceptor).transpose()?;
    let router = gateway::router(channel, cors);

    let listener = bind(
        ServerKind::Gateway,
        config.bind_addr(config.server.http.port)?,
    )
    .await?;
    let addr = listener.local_addr()?;
    Ok(ServerTask::spawn(ServerKind::Gateway, addr, events, |cancel| {
        gateway::serve(listener, router, acceptor, cancel)
    }))
}
