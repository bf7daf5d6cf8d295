use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::middleware::InterceptorChain;
use crate::proto::tenancy_server::Tenancy;
use crate::proto::{
    TenantCreateRequest, TenantCreateResponse, TenantDeleteRequest, TenantDeleteResponse,
    TenantListRequest, TenantListResponse,
};
use crate::storage::{Page, TenantReader, TenantWriter};

const CREATE: &str = "/base.v1.Tenancy/Create";
const DELETE: &str = "/base.v1.Tenancy/Delete";
const LIST: &str = "/base.v1.Tenancy/List";

/// Tenant management API.
pub struct TenancyService {
    reader: Arc<dyn TenantReader>,
    writer: Arc<dyn TenantWriter>,
    chain: InterceptorChain,
}

impl TenancyService {
    /// Creates the service over tenant storage.
    pub fn new(
        reader: Arc<dyn TenantReader>,
        writer: Arc<dyn TenantWriter>,
        chain: InterceptorChain,
    ) -> Self {
        Self {
            reader,
            writer,
            chain,
        }
    }
}

#[tonic::async_trait]
impl Tenancy for TenancyService {
    async fn create(
        &self,
        request: Request<TenantCreateRequest>,
    ) -> Result<Response<TenantCreateResponse>, Status> {
        let writer = Arc::clone(&self.writer);
        self.chain
            .unary(CREATE, request, move |req| async move {
                let tenant = writer.create_tenant(&req.id, &req.name).await?;
                Ok::<_, Status>(TenantCreateResponse {
                    tenant: Some(tenant),
                })
            })
            .await
    }

    async fn delete(
        &self,
        request: Request<TenantDeleteRequest>,
    ) -> Result<Response<TenantDeleteResponse>, Status> {
        let writer = Arc::clone(&self.writer);
        self.chain
            .unary(DELETE, request, move |req| async move {
                let tenant = writer.delete_tenant(&req.id).await?;
                Ok::<_, Status>(TenantDeleteResponse {
                    tenant: Some(tenant),
                })
            })
            .await
    }

    async fn list(
        &self,
        request: Request<TenantListRequest>,
    ) -> Result<Response<TenantListResponse>, Status> {
        let reader = Arc::clone(&self.reader);
        self.chain
            .unary(LIST, request, move |req| async move {
                let (tenants, continuous_token) = reader
                    .list_tenants(Page::new(req.page_size, req.continuous_token))
                    .await?;
                Ok::<_, Status>(TenantListResponse {
                    tenants,
                    continuous_token,
                })
            })
            .await
    }
}
