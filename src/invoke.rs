//! Permission evaluation interface and a direct-lookup evaluator.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::proto::{
    CheckResult, EntityFilter, PermissionCheckRequest, PermissionCheckResponse,
    PermissionCheckResponseMetadata, PermissionLookupEntityRequest,
    PermissionLookupEntityResponse, SubjectFilter, TupleFilter,
};
use crate::storage::{DataReader, Page};

/// Evaluates permission requests.
///
/// The primary server and the invoker server each hold one of these. The
/// invoker server's instance is expected to evaluate locally without forwarding.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Decides whether the subject holds the permission on the entity.
    async fn check(
        &self,
        request: PermissionCheckRequest,
    ) -> Result<PermissionCheckResponse, ServiceError>;

    /// Lists entities of a type on which the subject holds the permission.
    async fn lookup_entity(
        &self,
        request: PermissionLookupEntityRequest,
    ) -> Result<PermissionLookupEntityResponse, ServiceError>;
}

/// Evaluator that answers from stored tuples only.
///
/// A check is allowed when a tuple `entity#permission@subject` exists. No
/// schema rewrite rules are followed.
pub struct DirectInvoker {
    reader: Arc<dyn DataReader>,
}

impl DirectInvoker {
    /// Creates an evaluator over the given relationship reader.
    pub fn new(reader: Arc<dyn DataReader>) -> Self {
        Self { reader }
    }

    async fn snapshot(&self, tenant_id: &str, requested: &str) -> Result<String, ServiceError> {
        if requested.is_empty() {
            self.reader.head_snapshot(tenant_id).await
        } else {
            Ok(requested.to_string())
        }
    }
}

#[async_trait]
impl Invoker for DirectInvoker {
    async fn check(
        &self,
        request: PermissionCheckRequest,
    ) -> Result<PermissionCheckResponse, ServiceError> {
        let entity = request
            .entity
            .ok_or_else(|| ServiceError::InvalidArgument("entity is required".into()))?;
        let subject = request
            .subject
            .ok_or_else(|| ServiceError::InvalidArgument("subject is required".into()))?;
        let requested = request.metadata.map(|m| m.snap_token).unwrap_or_default();
        let snap_token = self.snapshot(&request.tenant_id, &requested).await?;

        let filter = TupleFilter {
            entity: Some(EntityFilter {
                r#type: entity.r#type,
                ids: vec![entity.id],
            }),
            relation: request.permission,
            subject: Some(SubjectFilter {
                r#type: subject.r#type,
                ids: vec![subject.id],
                relation: subject.relation,
            }),
        };

        let (tuples, _) = self
            .reader
            .read_relationships(&request.tenant_id, &filter, &snap_token, Page::new(1, ""))
            .await?;

        let can = if tuples.is_empty() {
            CheckResult::Denied
        } else {
            CheckResult::Allowed
        };

        Ok(PermissionCheckResponse {
            can: can as i32,
            metadata: Some(PermissionCheckResponseMetadata { check_count: 1 }),
        })
    }

    async fn lookup_entity(
        &self,
        request: PermissionLookupEntityRequest,
    ) -> Result<PermissionLookupEntityResponse, ServiceError> {
        let subject = request
            .subject
            .ok_or_else(|| ServiceError::InvalidArgument("subject is required".into()))?;
        let requested = request.metadata.map(|m| m.snap_token).unwrap_or_default();
        let snap_token = self.snapshot(&request.tenant_id, &requested).await?;

        let filter = TupleFilter {
            entity: Some(EntityFilter {
                r#type: request.entity_type,
                ids: vec![],
            }),
            relation: request.permission,
            subject: Some(SubjectFilter {
                r#type: subject.r#type,
                ids: vec![subject.id],
                relation: subject.relation,
            }),
        };

        let (tuples, continuous_token) = self
            .reader
            .read_relationships(
                &request.tenant_id,
                &filter,
                &snap_token,
                Page::new(request.page_size, request.continuous_token),
            )
            .await?;

        let entity_ids: BTreeSet<String> = tuples
            .into_iter()
            .filter_map(|t| t.entity.map(|e| e.id))
            .collect();

        Ok(PermissionLookupEntityResponse {
            entity_ids: entity_ids.into_iter().collect(),
            continuous_token,
        })
    }
}
