use async_trait::async_trait;
use tonic::Status;
use tracing::debug;

use super::{Call, Interceptor, Next, Reply};

/// First stage: rejects structurally invalid requests with `INVALID_ARGUMENT`.
///
/// Nothing after this stage, including the rate limiter, sees a rejected call.
pub struct ValidationInterceptor;

#[async_trait]
impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn intercept(&self, call: &Call<'_>, next: Next<'_>) -> Result<Reply, Status> {
        if let Err(e) = call.message.validate() {
            debug!(method = call.method, field = %e.field, "request failed validation");
            return Err(e.into());
        }
        next.run(call).await
    }
}
