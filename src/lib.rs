//! Permission service runtime.
//!
//! Runs the primary gRPC server, the invoker gRPC server, an HTTP/JSON gateway
//! and an optional diagnostics sidecar as one unit. Every RPC passes through
//! the same interceptor chain: validation, panic recovery, rate limiting and,
//! when enabled, authentication.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use permify_server::{Config, Container, MemoryStore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> permify_server::Result<()> {
//! let config = Config::from_env()?;
//! let container = Container::in_memory(Arc::new(MemoryStore::new()));
//! let local = Arc::clone(&container.invoker);
//! container.run(CancellationToken::new(), &config, local).await
//! # }
//! ```

pub mod authn;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invoke;
pub mod middleware;
pub mod profiler;
pub mod servers;
pub mod storage;
pub mod tls;
pub mod validation;

/// Generated protocol buffer types and gRPC stubs for `base.v1`.
#[allow(clippy::all, missing_docs)]
pub mod proto {
    tonic::include_proto!("base.v1");

    /// Encoded descriptor set served by the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("base_v1_descriptor");
}

pub use config::Config;
pub use error::{Error, Result, ServiceError};
pub use invoke::{DirectInvoker, Invoker};
pub use middleware::{InterceptorChain, RateLimiter};
pub use servers::{Container, LifecycleState, ServerEvent, ServerKind, ServerSet};
pub use storage::MemoryStore;
