use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::invoke::Invoker;
use crate::middleware::InterceptorChain;
use crate::proto::permission_server::Permission;
use crate::proto::{
    PermissionCheckRequest, PermissionCheckResponse, PermissionLookupEntityRequest,
    PermissionLookupEntityResponse,
};

const CHECK: &str = "/base.v1.Permission/Check";
const LOOKUP_ENTITY: &str = "/base.v1.Permission/LookupEntity";

/// Permission API. Registered on both the primary and the invoker server, each
/// with its own evaluator.
pub struct PermissionService {
    invoker: Arc<dyn Invoker>,
    chain: InterceptorChain,
}

impl PermissionService {
    /// Creates the service over an evaluator.
    pub fn new(invoker: Arc<dyn Invoker>, chain: InterceptorChain) -> Self {
        Self { invoker, chain }
    }
}

#[tonic::async_trait]
impl Permission for PermissionService {
    async fn check(
        &self,
        request: Request<PermissionCheckRequest>,
    ) -> Result<Response<PermissionCheckResponse>, Status> {
        let invoker = Arc::clone(&self.invoker);
        self.chain
            .unary(CHECK, request, move |req| async move {
                invoker.check(req).await.map_err(Status::from)
            })
            .await
    }

    async fn lookup_entity(
        &self,
        request: Request<PermissionLookupEntityRequest>,
    ) -> Result<Response<PermissionLookupEntityResponse>, Status> {
        let invoker = Arc::clone(&self.invoker);
        self.chain
            .unary(LOOKUP_ENTITY, request, move |req| async move {
                invoker.lookup_entity(req).await.map_err(Status::from)
            })
            .await
    }
}
