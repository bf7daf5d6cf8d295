use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::middleware::InterceptorChain;
use crate::proto::schema_server::Schema;
use crate::proto::{SchemaReadRequest, SchemaReadResponse, SchemaWriteRequest, SchemaWriteResponse};
use crate::storage::{SchemaReader, SchemaWriter};

const WRITE: &str = "/base.v1.Schema/Write";
const READ: &str = "/base.v1.Schema/Read";

/// Schema API.
pub struct SchemaService {
    reader: Arc<dyn SchemaReader>,
    writer: Arc<dyn SchemaWriter>,
    chain: InterceptorChain,
}

impl SchemaService {
    /// Creates the service over schema storage.
    pub fn new(
        reader: Arc<dyn SchemaReader>,
        writer: Arc<dyn SchemaWriter>,
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
impl Schema for SchemaService {
    async fn write(
        &self,
        request: Request<SchemaWriteRequest>,
    ) -> Result<Response<SchemaWriteResponse>, Status> {
        let writer = Arc::clone(&self.writer);
        self.chain
            .unary(WRITE, request, move |req| async move {
                let schema_version = writer.write_schema(&req.tenant_id, req.schema).await?;
                Ok::<_, Status>(SchemaWriteResponse { schema_version })
            })
            .await
    }

    async fn read(
        &self,
        request: Request<SchemaReadRequest>,
    ) -> Result<Response<SchemaReadResponse>, Status> {
        let reader = Arc::clone(&self.reader);
        self.chain
            .unary(READ, request, move |req| async move {
                let version = req.metadata.map(|m| m.schema_version).unwrap_or_default();
                let (schema, schema_version) = reader.read_schema(&req.tenant_id, &version).await?;
                Ok::<_, Status>(SchemaReadResponse {
                    schema,
                    schema_version,
                })
            })
            .await
    }
}
