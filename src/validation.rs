//! Request validation rules.
//!
//! Every request message accepted by the gRPC services implements [`Validate`].
//! The validation interceptor runs these rules before any other stage sees the call.

use std::sync::LazyLock;

use regex::Regex;
use tonic::Status;

use crate::proto::{
    DataDeleteRequest, DataWriteRequest, Entity, PermissionCheckRequest,
    PermissionLookupEntityRequest, RelationshipReadRequest, SchemaReadRequest,
    SchemaWriteRequest, Subject, TenantCreateRequest, TenantDeleteRequest, TenantListRequest,
    Tuple, TupleFilter, WatchRequest,
};

/// Largest page a listing call may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Largest number of tuples a single write may carry.
pub const MAX_WRITE_TUPLES: usize = 100;

/// Smallest evaluation depth a check may request.
pub const MIN_DEPTH: i32 = 3;

static TENANT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z0-9_\-@\.:+]{1,128}|\*)$").expect("valid regex"));
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{1,62}[a-z0-9]$").expect("valid regex"));
static ENTITY_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([a-zA-Z0-9_][a-zA-Z0-9/_|-]{0,127})|\*)$").expect("valid regex")
});

/// A field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ValidationError> for Status {
    fn from(err: ValidationError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

/// Structural checks a request must pass before it is processed.
pub trait Validate {
    /// Returns the first rule the message breaks.
    fn validate(&self) -> Result<(), ValidationError>;
}

fn pattern(field: &str, value: &str, re: &Regex, expected: &str) -> Result<(), ValidationError> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new(
            field,
            format!("{value:?} does not match {expected}"),
        ))
    }
}

fn tenant_id(field: &str, value: &str) -> Result<(), ValidationError> {
    pattern(field, value, &TENANT_ID, "a tenant id")
}

fn identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    pattern(field, value, &IDENTIFIER, "a lowercase identifier")
}

fn entity_id(field: &str, value: &str) -> Result<(), ValidationError> {
    pattern(field, value, &ENTITY_ID, "an entity id")
}

fn required<'a, T>(field: &str, value: &'a Option<T>) -> Result<&'a T, ValidationError> {
    value
        .as_ref()
        .ok_or_else(|| ValidationError::new(field, "is required"))
}

fn depth(field: &str, value: i32) -> Result<(), ValidationError> {
    if value < MIN_DEPTH {
        return Err(ValidationError::new(
            field,
            format!("must be at least {MIN_DEPTH}"),
        ));
    }
    Ok(())
}

fn page_size(field: &str, value: u32) -> Result<(), ValidationError> {
    if value > MAX_PAGE_SIZE {
        return Err(ValidationError::new(
            field,
            format!("must not exceed {MAX_PAGE_SIZE}"),
        ));
    }
    Ok(())
}

fn entity(field: &str, value: &Entity) -> Result<(), ValidationError> {
    identifier(&format!("{field}.type"), &value.r#type)?;
    entity_id(&format!("{field}.id"), &value.id)
}

fn subject(field: &str, value: &Subject) -> Result<(), ValidationError> {
    identifier(&format!("{field}.type"), &value.r#type)?;
    entity_id(&format!("{field}.id"), &value.id)?;
    if !value.relation.is_empty() {
        identifier(&format!("{field}.relation"), &value.relation)?;
    }
    Ok(())
}

fn tuple(field: &str, value: &Tuple) -> Result<(), ValidationError> {
    entity(
        &format!("{field}.entity"),
        required(&format!("{field}.entity"), &value.entity)?,
    )?;
    identifier(&format!("{field}.relation"), &value.relation)?;
    subject(
        &format!("{field}.subject"),
        required(&format!("{field}.subject"), &value.subject)?,
    )
}

fn tuple_filter(field: &str, value: &TupleFilter) -> Result<(), ValidationError> {
    let entity = required(&format!("{field}.entity"), &value.entity)?;
    identifier(&format!("{field}.entity.type"), &entity.r#type)?;
    for (i, id) in entity.ids.iter().enumerate() {
        entity_id(&format!("{field}.entity.ids[{i}]"), id)?;
    }
    if !value.relation.is_empty() {
        identifier(&format!("{field}.relation"), &value.relation)?;
    }
    if let Some(subject) = &value.subject {
        if !subject.r#type.is_empty() {
            identifier(&format!("{field}.subject.type"), &subject.r#type)?;
        }
        for (i, id) in subject.ids.iter().enumerate() {
            entity_id(&format!("{field}.subject.ids[{i}]"), id)?;
        }
        if !subject.relation.is_empty() {
            identifier(&format!("{field}.subject.relation"), &subject.relation)?;
        }
    }
    Ok(())
}

impl Validate for PermissionCheckRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        depth("metadata.depth", required("metadata", &self.metadata)?.depth)?;
        entity("entity", required("entity", &self.entity)?)?;
        identifier("permission", &self.permission)?;
        subject("subject", required("subject", &self.subject)?)
    }
}

impl Validate for PermissionLookupEntityRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        depth("metadata.depth", required("metadata", &self.metadata)?.depth)?;
        identifier("entity_type", &self.entity_type)?;
        identifier("permission", &self.permission)?;
        subject("subject", required("subject", &self.subject)?)?;
        page_size("page_size", self.page_size)
    }
}

impl Validate for SchemaWriteRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        if self.schema.trim().is_empty() {
            return Err(ValidationError::new("schema", "must not be empty"));
        }
        Ok(())
    }
}

impl Validate for SchemaReadRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        required("metadata", &self.metadata)?;
        Ok(())
    }
}

impl Validate for DataWriteRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        required("metadata", &self.metadata)?;
        if self.tuples.len() > MAX_WRITE_TUPLES {
            return Err(ValidationError::new(
                "tuples",
                format!("must not exceed {MAX_WRITE_TUPLES} items"),
            ));
        }
        for (i, t) in self.tuples.iter().enumerate() {
            tuple(&format!("tuples[{i}]"), t)?;
        }
        Ok(())
    }
}

impl Validate for RelationshipReadRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        required("metadata", &self.metadata)?;
        tuple_filter("filter", required("filter", &self.filter)?)?;
        page_size("page_size", self.page_size)
    }
}

impl Validate for DataDeleteRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)?;
        tuple_filter("tuple_filter", required("tuple_filter", &self.tuple_filter)?)
    }
}

impl Validate for TenantCreateRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("id", &self.id)?;
        if self.name.is_empty() || self.name.chars().count() > 64 {
            return Err(ValidationError::new("name", "must be 1 to 64 characters"));
        }
        Ok(())
    }
}

impl Validate for TenantDeleteRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("id", &self.id)
    }
}

impl Validate for TenantListRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        page_size("page_size", self.page_size)
    }
}

impl Validate for WatchRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        tenant_id("tenant_id", &self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::proto::{EntityFilter, PermissionCheckRequestMetadata};

    fn check_request() -> PermissionCheckRequest {
        PermissionCheckRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(PermissionCheckRequestMetadata {
                depth: 20,
                ..Default::default()
            }),
            entity: Some(Entity {
                r#type: "document".to_string(),
                id: "1".to_string(),
            }),
            permission: "view".to_string(),
            subject: Some(Subject {
                r#type: "user".to_string(),
                id: "alice".to_string(),
                relation: String::new(),
            }),
        }
    }

    #[test]
    fn accepts_well_formed_check() {
        assert!(check_request().validate().is_ok());
    }

    #[test]
    fn check_requires_metadata() {
        let mut request = check_request();
        request.metadata = None;

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "metadata");
    }

    #[test]
    fn check_rejects_shallow_depth() {
        let mut request = check_request();
        request.metadata = Some(PermissionCheckRequestMetadata {
            depth: 2,
            ..Default::default()
        });

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "metadata.depth");
    }

    #[test]
    fn check_rejects_uppercase_permission() {
        let mut request = check_request();
        request.permission = "View".to_string();

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "permission");
    }

    #[test]
    fn wildcard_tenant_is_allowed() {
        let mut request = check_request();
        request.tenant_id = "*".to_string();

        assert!(request.validate().is_ok());
    }

    #[test]
    fn write_rejects_oversized_batches() {
        let tuple = Tuple {
            entity: check_request().entity,
            relation: "owner".to_string(),
            subject: check_request().subject,
        };
        let request = DataWriteRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(Default::default()),
            tuples: vec![tuple; MAX_WRITE_TUPLES + 1],
        };

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "tuples");
    }

    #[test]
    fn write_reports_offending_tuple() {
        let request = DataWriteRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(Default::default()),
            tuples: vec![Tuple {
                entity: check_request().entity,
                relation: "owner".to_string(),
                subject: None,
            }],
        };

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "tuples[0].subject");
    }

    #[test]
    fn delete_requires_entity_type() {
        let request = DataDeleteRequest {
            tenant_id: "t1".to_string(),
            tuple_filter: Some(TupleFilter {
                entity: Some(EntityFilter::default()),
                ..Default::default()
            }),
        };

        let err = request.validate().unwrap_err();
        assert_eq!(err.field, "tuple_filter.entity.type");
    }

    #[test]
    fn list_rejects_large_pages() {
        let request = TenantListRequest {
            page_size: MAX_PAGE_SIZE + 1,
            continuous_token: String::new(),
        };

        assert!(request.validate().is_err());
        assert!(TenantListRequest::default().validate().is_ok());
    }

    #[test]
    fn validation_error_maps_to_invalid_argument() {
        let status = Status::from(ValidationError::new("tenant_id", "is required"));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "invalid tenant_id: is required");
    }

    proptest! {
        #[test]
        fn identifiers_follow_lowercase_pattern(name in "[a-z][a-z0-9_]{1,62}[a-z0-9]") {
            prop_assert!(identifier("relation", &name).is_ok());
        }

        #[test]
        fn identifiers_reject_leading_digits(name in "[0-9][a-z0-9_]{1,20}") {
            prop_assert!(identifier("relation", &name).is_err());
        }

        #[test]
        fn tenant_ids_longer_than_128_rejected(id in "[a-z]{129,160}") {
            prop_assert!(tenant_id("tenant_id", &id).is_err());
        }
    }
}
