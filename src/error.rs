//! Error types for the permission server.

use std::net::SocketAddr;

use tonic::{Code, Status};

use crate::servers::lifecycle::ServerKind;

/// Errors raised while starting, running or stopping the server set.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured authentication method is not one of `preshared` or `oidc`.
    #[error("unknown authentication method: {0:?}")]
    UnknownAuthnMethod(String),

    /// Authentication is enabled but its settings are unusable.
    #[error("invalid authentication configuration: {0}")]
    AuthnConfig(String),

    /// The OIDC issuer metadata or key set could not be fetched.
    #[error("oidc discovery failed for {issuer}: {reason}")]
    OidcDiscovery {
        /// Issuer URL that was queried.
        issuer: String,
        /// What went wrong.
        reason: String,
    },

    /// TLS material could not be loaded or parsed.
    #[error("tls error: {0}")]
    Tls(String),

    /// Configuration is malformed or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A listener could not be bound.
    #[error("failed to bind {server} listener on {addr}: {source}")]
    Bind {
        /// Which server the listener belongs to.
        server: ServerKind,
        /// Requested bind address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The gateway could not connect back to the primary server.
    #[error("gateway failed to dial primary server at {addr}: {reason}")]
    Dial {
        /// Primary server address.
        addr: SocketAddr,
        /// What went wrong.
        reason: String,
    },

    /// A running server stopped with an error.
    #[error("{server} server failed: {reason}")]
    Serve {
        /// Which server failed.
        server: ServerKind,
        /// What went wrong.
        reason: String,
    },

    /// One or more shutdown steps failed. Every other step still ran.
    #[error("shutdown incomplete: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    /// gRPC transport setup failed.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Reflection service could not be built from the descriptor set.
    #[error("reflection error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// Generic I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by storage and evaluation collaborators.
///
/// Every variant maps to a stable gRPC code so clients always see the same
/// status for the same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The addressed tenant, schema or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request is well-formed but semantically invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The system is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The backing store is temporarily unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("internal: {0}")]
    Internal(String),
}

impl ServiceError {
    /// gRPC code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            ServiceError::NotFound(_) => Code::NotFound,
            ServiceError::AlreadyExists(_) => Code::AlreadyExists,
            ServiceError::InvalidArgument(_) => Code::InvalidArgument,
            ServiceError::FailedPrecondition(_) => Code::FailedPrecondition,
            ServiceError::Unavailable(_) => Code::Unavailable,
            ServiceError::Internal(_) => Code::Internal,
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}
