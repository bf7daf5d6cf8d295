use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::middleware::InterceptorChain;
use crate::proto::data_server::Data;
use crate::proto::{
    DataDeleteRequest, DataDeleteResponse, DataWriteRequest, DataWriteResponse,
    RelationshipReadRequest, RelationshipReadResponse,
};
use crate::storage::{DataReader, DataWriter, Page};

const WRITE: &str = "/base.v1.Data/Write";
const READ_RELATIONSHIPS: &str = "/base.v1.Data/ReadRelationships";
const DELETE: &str = "/base.v1.Data/Delete";

/// Relationship data API.
pub struct DataService {
    reader: Arc<dyn DataReader>,
    writer: Arc<dyn DataWriter>,
    chain: InterceptorChain,
}

impl DataService {
    /// Creates the service over relationship storage.
    pub fn new(
        reader: Arc<dyn DataReader>,
        writer: Arc<dyn DataWriter>,
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
impl Data for DataService {
    async fn write(
        &self,
        request: Request<DataWriteRequest>,
    ) -> Result<Response<DataWriteResponse>, Status> {
        let writer = Arc::clone(&self.writer);
        self.chain
            .unary(WRITE, request, move |req| async move {
                let snap_token = writer.write(&req.tenant_id, req.tuples).await?;
                Ok::<_, Status>(DataWriteResponse { snap_token })
            })
            .await
    }

    async fn read_relationships(
        &self,
        request: Request<RelationshipReadRequest>,
    ) -> Result<Response<RelationshipReadResponse>, Status> {
        let reader = Arc::clone(&self.reader);
        self.chain
            .unary(READ_RELATIONSHIPS, request, move |req| async move {
                let snap_token = req.metadata.map(|m| m.snap_token).unwrap_or_default();
                let filter = req.filter.unwrap_or_default();
                let (tuples, continuous_token) = reader
                    .read_relationships(
                        &req.tenant_id,
                        &filter,
                        &snap_token,
                        Page::new(req.page_size, req.continuous_token),
                    )
                    .await?;
                Ok::<_, Status>(RelationshipReadResponse {
                    tuples,
                    continuous_token,
                })
            })
            .await
    }

    async fn delete(
        &self,
        request: Request<DataDeleteRequest>,
    ) -> Result<Response<DataDeleteResponse>, Status> {
        let writer = Arc::clone(&self.writer);
        self.chain
            .unary(DELETE, request, move |req| async move {
                let filter = req.tuple_filter.unwrap_or_default();
                let snap_token = writer.delete(&req.tenant_id, &filter).await?;
                Ok::<_, Status>(DataDeleteResponse { snap_token })
            })
            .await
    }
}
