use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{
    ChangeStream, DataReader, DataWriter, Page, SchemaReader, SchemaWriter, TenantReader,
    TenantWriter, Watcher,
};
use crate::error::ServiceError;
use crate::proto::{
    DataChange, DataChangeOperation, DataChanges, Tenant, Tuple, TupleFilter,
};

/// Tenant every store starts with.
pub const DEFAULT_TENANT: &str = "t1";

const MAX_TOTAL_TENANTS: usize = 10_000;
const CHANGE_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
struct SchemaVersion {
    version: String,
    schema: String,
}

/// In-process storage backing every storage collaborator interface.
///
/// Snapshot tokens are a single monotonically increasing counter shared by all
/// tenants. Watchers only see changes committed after they subscribe.
pub struct MemoryStore {
    tenants: RwLock<BTreeMap<String, Tenant>>,
    schemas: RwLock<HashMap<String, Vec<SchemaVersion>>>,
    tuples: RwLock<HashMap<String, Vec<Tuple>>>,
    snapshot: AtomicU64,
    changes: broadcast::Sender<(String, DataChanges)>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn parse_offset(token: &str) -> Result<usize, ServiceError> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse()
        .map_err(|_| ServiceError::InvalidArgument(format!("invalid continuous token {token:?}")))
}

fn paginate<T: Clone>(items: &[T], page: &Page) -> Result<(Vec<T>, String), ServiceError> {
    let offset = parse_offset(&page.token)?;
    let end = offset.saturating_add(page.limit()).min(items.len());
    let slice = items.get(offset..end).unwrap_or_default().to_vec();
    let next = if end < items.len() {
        end.to_string()
    } else {
        String::new()
    };
    Ok((slice, next))
}

/// Whether `tuple` is selected by `filter`. Empty filter fields match anything.
pub fn matches(filter: &TupleFilter, tuple: &Tuple) -> bool {
    let (Some(entity), Some(subject)) = (&tuple.entity, &tuple.subject) else {
        return false;
    };

    if let Some(ef) = &filter.entity {
        if !ef.r#type.is_empty() && ef.r#type != entity.r#type {
            return false;
        }
        if !ef.ids.is_empty() && !ef.ids.contains(&entity.id) {
            return false;
        }
    }

    if !filter.relation.is_empty() && filter.relation != tuple.relation {
        return false;
    }

    if let Some(sf) = &filter.subject {
        if !sf.r#type.is_empty() && sf.r#type != subject.r#type {
            return false;
        }
        if !sf.ids.is_empty() && !sf.ids.contains(&subject.id) {
            return false;
        }
        if !sf.relation.is_empty() && sf.relation != subject.relation {
            return false;
        }
    }

    true
}

impl MemoryStore {
    /// Creates an empty store holding only the default tenant.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let mut tenants = BTreeMap::new();
        tenants.insert(
            DEFAULT_TENANT.to_string(),
            Tenant {
                id: DEFAULT_TENANT.to_string(),
                name: "example tenant".to_string(),
                created_at: now_secs(),
            },
        );

        Self {
            tenants: RwLock::new(tenants),
            schemas: RwLock::new(HashMap::new()),
            tuples: RwLock::new(HashMap::new()),
            snapshot: AtomicU64::new(0),
            changes,
        }
    }

    fn next_snapshot(&self) -> String {
        (self.snapshot.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, tenant_id: &str, changes: DataChanges) {
        if changes.data_changes.is_empty() {
            return;
        }
        // No receivers is fine.
        let _ = self.changes.send((tenant_id.to_string(), changes));
    }

    /// Number of tuples stored for a tenant.
    pub async fn tuple_count(&self, tenant_id: &str) -> usize {
        self.tuples
            .read()
            .await
            .get(tenant_id)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataReader for MemoryStore {
    async fn read_relationships(
        &self,
        tenant_id: &str,
        filter: &TupleFilter,
        _snap_token: &str,
        page: Page,
    ) -> Result<(Vec<Tuple>, String), ServiceError> {
        let tuples = self.tuples.read().await;
        let selected: Vec<Tuple> = tuples
            .get(tenant_id)
            .map(|all| all.iter().filter(|t| matches(filter, t)).cloned().collect())
            .unwrap_or_default();
        paginate(&selected, &page)
    }

    async fn head_snapshot(&self, _tenant_id: &str) -> Result<String, ServiceError> {
        Ok(self.snapshot.load(Ordering::SeqCst).to_string())
    }
}

#[async_trait]
impl DataWriter for MemoryStore {
    async fn write(&self, tenant_id: &str, tuples: Vec<Tuple>) -> Result<String, ServiceError> {
        let mut all = self.tuples.write().await;
        let stored = all.entry(tenant_id.to_string()).or_default();

        let mut created = Vec::new();
        for tuple in tuples {
            if !stored.contains(&tuple) {
                stored.push(tuple.clone());
                created.push(DataChange {
                    operation: DataChangeOperation::Create as i32,
                    tuple: Some(tuple),
                });
            }
        }

        let snap_token = self.next_snapshot();
        debug!(tenant_id, written = created.len(), %snap_token, "relationships written");
        self.publish(
            tenant_id,
            DataChanges {
                snap_token: snap_token.clone(),
                data_changes: created,
            },
        );
        Ok(snap_token)
    }

    async fn delete(&self, tenant_id: &str, filter: &TupleFilter) -> Result<String, ServiceError> {
        let mut all = self.tuples.write().await;
        let mut deleted = Vec::new();
        if let Some(stored) = all.get_mut(tenant_id) {
            stored.retain(|t| {
                if matches(filter, t) {
                    deleted.push(DataChange {
                        operation: DataChangeOperation::Delete as i32,
                        tuple: Some(t.clone()),
                    });
                    false
                } else {
                    true
                }
            });
        }

        let snap_token = self.next_snapshot();
        debug!(tenant_id, deleted = deleted.len(), %snap_token, "relationships deleted");
        self.publish(
            tenant_id,
            DataChanges {
                snap_token: snap_token.clone(),
                data_changes: deleted,
            },
        );
        Ok(snap_token)
    }
}

#[async_trait]
impl SchemaReader for MemoryStore {
    async fn read_schema(
        &self,
        tenant_id: &str,
        version: &str,
    ) -> Result<(String, String), ServiceError> {
        let schemas = self.schemas.read().await;
        let versions = schemas
            .get(tenant_id)
            .ok_or_else(|| ServiceError::NotFound(format!("schema for tenant {tenant_id}")))?;

        let found = if version.is_empty() {
            versions.last()
        } else {
            versions.iter().find(|v| v.version == version)
        };

        found
            .map(|v| (v.schema.clone(), v.version.clone()))
            .ok_or_else(|| ServiceError::NotFound(format!("schema version {version:?}")))
    }

    async fn head_version(&self, tenant_id: &str) -> Result<String, ServiceError> {
        self.schemas
            .read()
            .await
            .get(tenant_id)
            .and_then(|v| v.last())
            .map(|v| v.version.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("schema for tenant {tenant_id}")))
    }
}

#[async_trait]
impl SchemaWriter for MemoryStore {
    async fn write_schema(&self, tenant_id: &str, schema: String) -> Result<String, ServiceError> {
        let version = uuid::Uuid::new_v4().simple().to_string();
        self.schemas
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .push(SchemaVersion {
                version: version.clone(),
                schema,
            });
        Ok(version)
    }
}

#[async_trait]
impl TenantReader for MemoryStore {
    async fn list_tenants(&self, page: Page) -> Result<(Vec<Tenant>, String), ServiceError> {
        let tenants: Vec<Tenant> = self.tenants.read().await.values().cloned().collect();
        paginate(&tenants, &page)
    }
}

#[async_trait]
impl TenantWriter for MemoryStore {
    async fn create_tenant(&self, id: &str, name: &str) -> Result<Tenant, ServiceError> {
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(id) {
            return Err(ServiceError::AlreadyExists(format!("tenant {id}")));
        }
        if tenants.len() >= MAX_TOTAL_TENANTS {
            return Err(ServiceError::FailedPrecondition(
                "tenant limit reached".to_string(),
            ));
        }

        let tenant = Tenant {
            id: id.to_string(),
            name: name.to_string(),
            created_at: now_secs(),
        };
        tenants.insert(id.to_string(), tenant.clone());
        Ok(tenant)
    }

    async fn delete_tenant(&self, id: &str) -> Result<Tenant, ServiceError> {
        let tenant = self
            .tenants
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(format!("tenant {id}")))?;

        self.tuples.write().await.remove(id);
        self.schemas.write().await.remove(id);
        Ok(tenant)
    }
}

#[async_trait]
impl Watcher for MemoryStore {
    async fn watch(&self, tenant_id: &str, _snap_token: &str) -> Result<ChangeStream, ServiceError> {
        let tenant = tenant_id.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            let tenant = tenant.clone();
            async move {
                match item {
                    Ok((id, changes)) if id == tenant => Some(Ok(changes)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(tenant_id = %tenant, skipped, "watcher lagged behind");
                        Some(Err(ServiceError::Unavailable(format!(
                            "watch lagged, {skipped} change sets dropped"
                        ))))
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
