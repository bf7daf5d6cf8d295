//! Request pipeline shared by every gRPC service.
//!
//! Each service handler hands its decoded request to an [`InterceptorChain`]
//! which runs the stages in a fixed order before the handler body:
//!
//! 1. validation
//! 2. panic recovery
//! 3. rate limiting
//! 4. authentication, when enabled
//!
//! Unary and streaming calls get structurally identical chains. The order is
//! fixed by [`InterceptorChain::compose`] and cannot be changed by callers.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, histogram};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};

use crate::validation::Validate;

pub mod auth;
pub mod rate_limit;
pub mod recovery;
pub mod validation;

pub use auth::AuthInterceptor;
pub use rate_limit::{RateLimitInterceptor, RateLimiter};
pub use recovery::RecoveryInterceptor;
pub use validation::ValidationInterceptor;

/// Type-erased handler output travelling back through the chain.
pub type Reply = Box<dyn Any + Send>;

/// Shape of the RPC being intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Single request, single response.
    Unary,
    /// Single request, streamed responses.
    ServerStream,
}

/// What a stage can see of an in-flight call.
pub struct Call<'a> {
    /// Full gRPC method path, e.g. `/base.v1.Permission/Check`.
    pub method: &'static str,
    /// Unary or streaming.
    pub kind: CallKind,
    /// Request metadata (headers).
    pub metadata: &'a MetadataMap,
    /// Decoded request message.
    pub message: &'a (dyn Validate + Sync),
}

/// Remaining stages plus the handler body.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    endpoint: BoxFuture<'a, Result<Reply, Status>>,
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain.
    pub async fn run(self, call: &Call<'_>) -> Result<Reply, Status> {
        match self.rest.split_first() {
            Some((stage, rest)) => {
                stage
                    .intercept(
                        call,
                        Next {
                            rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => self.endpoint.await,
        }
    }
}

/// One stage of the request pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short stage name used in logs.
    fn name(&self) -> &'static str;

    /// Inspects the call and either rejects it or hands it to `next`.
    async fn intercept(&self, call: &Call<'_>, next: Next<'_>) -> Result<Reply, Status>;
}

/// Ordered unary and streaming stage lists shared by all services of a process.
#[derive(Clone)]
pub struct InterceptorChain {
    unary: Arc<[Arc<dyn Interceptor>]>,
    stream: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    /// Builds the chain: validation, recovery, rate limiting, then `auth` if given.
    pub fn compose(limiter: RateLimiter, auth: Option<AuthInterceptor>) -> Self {
        let mut stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(ValidationInterceptor),
            Arc::new(RecoveryInterceptor),
            Arc::new(RateLimitInterceptor::new(limiter)),
        ];
        if let Some(auth) = auth {
            stages.push(Arc::new(auth));
        }

        Self {
            unary: stages.clone().into(),
            stream: stages.into(),
        }
    }

    /// Stage names of the unary chain, in execution order.
    pub fn unary_stages(&self) -> Vec<&'static str> {
        self.unary.iter().map(|s| s.name()).collect()
    }

    /// Stage names of the streaming chain, in execution order.
    pub fn stream_stages(&self) -> Vec<&'static str> {
        self.stream.iter().map(|s| s.name()).collect()
    }

    /// Runs a unary call through the chain and then `handler`.
    ///
    /// # Errors
    /// Returns the status of the first stage that rejects the call, or the handler's error.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Validate + Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: FnOnce(Req) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.dispatch(&self.unary, CallKind::Unary, method, request, handler)
            .await
    }

    /// Runs a server-streaming call through the chain and then `handler`.
    ///
    /// Stages see the request that opens the stream. Items produced later are
    /// not intercepted.
    ///
    /// # Errors
    /// Returns the status of the first stage that rejects the call, or the handler's error.
    pub async fn stream<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Validate + Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: FnOnce(Req) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.dispatch(&self.stream, CallKind::ServerStream, method, request, handler)
            .await
    }

    async fn dispatch<Req, Resp, F, Fut>(
        &self,
        stages: &[Arc<dyn Interceptor>],
        kind: CallKind,
        method: &'static str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Validate + Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: FnOnce(Req) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let start = Instant::now();
        counter!("rpc.requests", "method" => method).increment(1);

        let (metadata, _extensions, message) = request.into_parts();
        let owned = message.clone();
        let endpoint = async move {
            let reply = handler(owned).await?;
            Ok::<Reply, Status>(Box::new(reply))
        }
        .boxed();

        let call = Call {
            method,
            kind,
            metadata: &metadata,
            message: &message,
        };
        let result = Next {
            rest: stages,
            endpoint,
        }
        .run(&call)
        .await
        .and_then(|reply| {
            reply
                .downcast::<Resp>()
                .map(|resp| Response::new(*resp))
                .map_err(|_| Status::internal("handler returned an unexpected response type"))
        });

        histogram!("rpc.duration", "method" => method).record(start.elapsed().as_secs_f64());
        if let Err(status) = &result {
            counter!(
                "rpc.errors",
                "method" => method,
                "code" => format!("{:?}", status.code())
            )
            .increment(1);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::{Authenticator, KeyAuthn};
    use crate::proto::TenantListRequest;

    #[test]
    fn base_chain_order() {
        let chain = InterceptorChain::compose(RateLimiter::new(10), None);

        assert_eq!(
            chain.unary_stages(),
            vec!["validation", "recovery", "rate_limit"]
        );
        assert_eq!(chain.unary_stages(), chain.stream_stages());
    }

    #[test]
    fn auth_is_appended_last() {
        let authn = Authenticator::Preshared(KeyAuthn::new(&["secret".to_string()]).unwrap());
        let chain =
            InterceptorChain::compose(RateLimiter::new(10), Some(AuthInterceptor::new(authn)));

        assert_eq!(
            chain.unary_stages(),
            vec!["validation", "recovery", "rate_limit", "auth"]
        );
        assert_eq!(chain.unary_stages(), chain.stream_stages());
    }

    #[tokio::test]
    async fn handler_sees_the_request() {
        let chain = InterceptorChain::compose(RateLimiter::new(10), None);

        let response = chain
            .unary(
                "/base.v1.Tenancy/List",
                Request::new(TenantListRequest {
                    page_size: 7,
                    continuous_token: String::new(),
                }),
                |req| async move { Ok::<_, Status>(req.page_size * 2) },
            )
            .await
            .unwrap();

        assert_eq!(response.into_inner(), 14);
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let chain = InterceptorChain::compose(RateLimiter::new(10), None);

        let status = chain
            .unary(
                "/base.v1.Tenancy/List",
                Request::new(TenantListRequest::default()),
                |_req| async move { Err::<(), _>(Status::not_found("nothing here")) },
            )
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
