use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use tonic::Status;
use tracing::error;

use super::{Call, Interceptor, Next, Reply};

/// Converts a panic in any later stage or the handler into `INTERNAL`.
pub struct RecoveryInterceptor;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[async_trait]
impl Interceptor for RecoveryInterceptor {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn intercept(&self, call: &Call<'_>, next: Next<'_>) -> Result<Reply, Status> {
        match AssertUnwindSafe(next.run(call)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                counter!("rpc.panics_recovered", "method" => call.method).increment(1);
                error!(
                    method = call.method,
                    panic = panic_message(payload.as_ref()),
                    "recovered from panic in request handler"
                );
                Err(Status::internal("internal error"))
            }
        }
    }
}
