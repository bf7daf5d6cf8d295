use async_trait::async_trait;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::warn;

use super::{Call, Interceptor, Next, Reply};
use crate::authn::{AuthnError, Authenticator};

/// Last stage: requires a bearer credential accepted by the configured authenticator.
pub struct AuthInterceptor {
    authenticator: Authenticator,
}

impl AuthInterceptor {
    /// Wraps the selected authenticator.
    pub fn new(authenticator: Authenticator) -> Self {
        Self { authenticator }
    }
}

/// Extracts the token from `authorization: Bearer <token>` metadata.
pub fn bearer_token(metadata: &MetadataMap) -> Result<&str, AuthnError> {
    let value = metadata
        .get("authorization")
        .ok_or(AuthnError::MissingCredentials)?
        .to_str()
        .map_err(|_| AuthnError::MissingCredentials)?;

    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthnError::MissingCredentials)
}

#[async_trait]
impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn intercept(&self, call: &Call<'_>, next: Next<'_>) -> Result<Reply, Status> {
        let token = bearer_token(call.metadata)?;
        if let Err(e) = self.authenticator.validate(token).await {
            warn!(
                method = call.method,
                strategy = self.authenticator.strategy(),
                error = %e,
                "request rejected by authenticator"
            );
            return Err(e.into());
        }
        next.run(call).await
    }
}
