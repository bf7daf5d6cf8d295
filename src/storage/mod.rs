//! Collaborator interfaces for relationship, schema and tenant storage.
//!
//! The servers only ever talk to storage through these traits. [`memory`]
//! provides an in-process implementation of all of them.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ServiceError;
use crate::proto::{DataChanges, Tenant, Tuple, TupleFilter};

pub mod memory;

pub use memory::MemoryStore;

/// Page size used when a request leaves it at zero.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Cursor for paginated reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of items to return, `0` for the default.
    pub size: u32,
    /// Opaque token returned by the previous page, empty for the first page.
    pub token: String,
}

impl Page {
    /// Builds a cursor from request fields.
    pub fn new(size: u32, token: impl Into<String>) -> Self {
        Self {
            size,
            token: token.into(),
        }
    }

    /// Effective page size.
    pub fn limit(&self) -> usize {
        if self.size == 0 {
            DEFAULT_PAGE_SIZE as usize
        } else {
            self.size as usize
        }
    }
}

/// Reads relationship tuples.
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Returns tuples matching `filter` and the token of the next page (empty when done).
    async fn read_relationships(
        &self,
        tenant_id: &str,
        filter: &TupleFilter,
        snap_token: &str,
        page: Page,
    ) -> Result<(Vec<Tuple>, String), ServiceError>;

    /// Snapshot token of the latest committed write.
    async fn head_snapshot(&self, tenant_id: &str) -> Result<String, ServiceError>;
}

/// Writes relationship tuples.
#[async_trait]
pub trait DataWriter: Send + Sync {
    /// Stores `tuples` and returns the resulting snapshot token.
    async fn write(&self, tenant_id: &str, tuples: Vec<Tuple>) -> Result<String, ServiceError>;

    /// Removes every tuple matching `filter` and returns the resulting snapshot token.
    async fn delete(&self, tenant_id: &str, filter: &TupleFilter) -> Result<String, ServiceError>;
}

/// Reads authorization schemas.
#[async_trait]
pub trait SchemaReader: Send + Sync {
    /// Returns the schema text for `version`, or the head version when empty.
    async fn read_schema(&self, tenant_id: &str, version: &str)
        -> Result<(String, String), ServiceError>;

    /// Latest schema version of the tenant.
    async fn head_version(&self, tenant_id: &str) -> Result<String, ServiceError>;
}

/// Writes authorization schemas.
#[async_trait]
pub trait SchemaWriter: Send + Sync {
    /// Stores a new schema and returns its version.
    async fn write_schema(&self, tenant_id: &str, schema: String) -> Result<String, ServiceError>;
}

/// Lists tenants.
#[async_trait]
pub trait TenantReader: Send + Sync {
    /// Returns one page of tenants and the token of the next page (empty when done).
    async fn list_tenants(&self, page: Page) -> Result<(Vec<Tenant>, String), ServiceError>;
}

/// Creates and deletes tenants.
#[async_trait]
pub trait TenantWriter: Send + Sync {
    /// Creates a tenant.
    async fn create_tenant(&self, id: &str, name: &str) -> Result<Tenant, ServiceError>;

    /// Deletes a tenant and returns what was removed.
    async fn delete_tenant(&self, id: &str) -> Result<Tenant, ServiceError>;
}

/// Stream of committed relationship changes.
pub type ChangeStream = BoxStream<'static, Result<DataChanges, ServiceError>>;

/// Source of relationship change notifications.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Streams changes committed for `tenant_id` after `snap_token`.
    async fn watch(&self, tenant_id: &str, snap_token: &str) -> Result<ChangeStream, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_page_size_uses_default() {
        assert_eq!(Page::default().limit(), DEFAULT_PAGE_SIZE as usize);
        assert_eq!(Page::new(7, "").limit(), 7);
    }
}
