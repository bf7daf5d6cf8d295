//! One handler per gateway route. Each decodes the JSON body into the request
//! message, forwards it to the primary server and returns the response as JSON.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use super::error::GatewayError;
use crate::proto::data_client::DataClient;
use crate::proto::permission_client::PermissionClient;
use crate::proto::schema_client::SchemaClient;
use crate::proto::tenancy_client::TenancyClient;
use crate::proto::{
    DataDeleteRequest, DataDeleteResponse, DataWriteRequest, DataWriteResponse,
    PermissionCheckRequest, PermissionCheckResponse, PermissionLookupEntityRequest,
    PermissionLookupEntityResponse, RelationshipReadRequest, RelationshipReadResponse,
    SchemaReadRequest, SchemaReadResponse, SchemaWriteRequest, SchemaWriteResponse,
    TenantCreateRequest, TenantCreateResponse, TenantDeleteRequest, TenantDeleteResponse,
    TenantListRequest, TenantListResponse,
};

/// gRPC clients sharing the gateway's single connection to the primary server.
#[derive(Clone)]
pub struct GatewayState {
    permission: PermissionClient<Channel>,
    schema: SchemaClient<Channel>,
    data: DataClient<Channel>,
    tenancy: TenancyClient<Channel>,
    health: HealthClient<Channel>,
}

impl GatewayState {
    /// Wraps a connected channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            permission: PermissionClient::new(channel.clone()),
            schema: SchemaClient::new(channel.clone()),
            data: DataClient::new(channel.clone()),
            tenancy: TenancyClient::new(channel.clone()),
            health: HealthClient::new(channel),
        }
    }
}

type JsonResult<T> = Result<Json<T>, GatewayError>;

/// Decodes a request body. An empty body yields the default message.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(GatewayError::malformed_body)
}

/// Wraps a message in a gRPC request carrying the caller's credentials.
fn forward<T>(headers: &HeaderMap, message: T) -> Request<T> {
    let mut request = Request::new(message);
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<MetadataValue<Ascii>>().ok())
    {
        request.metadata_mut().insert("authorization", value);
    }
    request
}

pub async fn check(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<PermissionCheckResponse> {
    let mut message: PermissionCheckRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state.permission.clone().check(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn lookup_entity(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<PermissionLookupEntityResponse> {
    let mut message: PermissionLookupEntityRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state
        .permission
        .clone()
        .lookup_entity(forward(&headers, message))
        .await?;
    Ok(Json(response.into_inner()))
}

pub async fn schema_write(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<SchemaWriteResponse> {
    let mut message: SchemaWriteRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state.schema.clone().write(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn schema_read(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<SchemaReadResponse> {
    let mut message: SchemaReadRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state.schema.clone().read(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn data_write(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<DataWriteResponse> {
    let mut message: DataWriteRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state.data.clone().write(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn read_relationships(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<RelationshipReadResponse> {
    let mut message: RelationshipReadRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state
        .data
        .clone()
        .read_relationships(forward(&headers, message))
        .await?;
    Ok(Json(response.into_inner()))
}

pub async fn data_delete(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<DataDeleteResponse> {
    let mut message: DataDeleteRequest = decode(&body)?;
    message.tenant_id = tenant_id;
    let response = state.data.clone().delete(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn tenant_create(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<TenantCreateResponse> {
    let message: TenantCreateRequest = decode(&body)?;
    let response = state.tenancy.clone().create(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn tenant_delete(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> JsonResult<TenantDeleteResponse> {
    let message = TenantDeleteRequest { id };
    let response = state.tenancy.clone().delete(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

pub async fn tenant_list(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResult<TenantListResponse> {
    let message: TenantListRequest = decode(&body)?;
    let response = state.tenancy.clone().list(forward(&headers, message)).await?;
    Ok(Json(response.into_inner()))
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    service: String,
}

/// Reports the primary server's health.
pub async fn healthz(
    State(state): State<GatewayState>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let request = HealthCheckRequest {
        service: query.service,
    };

    match state.health.clone().check(request).await {
        Ok(response) => {
            let status = ServingStatus::try_from(response.into_inner().status)
                .unwrap_or(ServingStatus::Unknown);
            if status == ServingStatus::Serving {
                (
                    StatusCode::OK,
                    Json(serde_json::json!({ "status": status.as_str_name() })),
                )
                    .into_response()
            } else {
                GatewayError(Status::unavailable(format!(
                    "primary server is {}",
                    status.as_str_name()
                )))
                .into_response()
            }
        }
        Err(status) => GatewayError(status).into_response(),
    }
}
