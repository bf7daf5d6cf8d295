use std::time::Instant;

use clap::{Parser, Subcommand};
use permify_server::proto::permission_client::PermissionClient;
use permify_server::proto::tenancy_client::TenancyClient;
use permify_server::proto::{
    CheckResult, Entity, PermissionCheckRequest, PermissionCheckRequestMetadata,
    PermissionLookupEntityRequest, PermissionLookupEntityRequestMetadata, Subject,
    TenantListRequest,
};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Request;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Permission service command line client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:3478")]
    server: String,

    /// Bearer token sent as `authorization` metadata
    #[arg(short, long, env = "PERMIFY_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a subject holds a permission on an entity
    Check {
        #[arg(long, default_value = "t1")]
        tenant: String,

        #[arg(short, long, help = "Entity as type:id, e.g. document:1")]
        entity: String,

        #[arg(short, long)]
        permission: String,

        #[arg(short, long, help = "Subject as type:id, e.g. user:alice")]
        subject: String,
    },

    /// List entity ids of a type the subject holds a permission on
    LookupEntity {
        #[arg(long, default_value = "t1")]
        tenant: String,

        #[arg(short, long)]
        entity_type: String,

        #[arg(short, long)]
        permission: String,

        #[arg(short, long, help = "Subject as type:id, e.g. user:alice")]
        subject: String,
    },

    /// List tenants
    Tenants,

    /// Query the server's health service
    Health {
        #[arg(long, default_value = "")]
        service: String,
    },
}

fn split_ref(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((kind, id)) if !kind.is_empty() && !id.is_empty() => {
            Ok((kind.to_string(), id.to_string()))
        }
        _ => Err(format!("expected type:id, got {value:?}")),
    }
}

fn authorized<T>(message: T, token: Option<&str>) -> Result<Request<T>, Box<dyn std::error::Error>> {
    let mut request = Request::new(message);
    if let Some(token) = token {
        let value: MetadataValue<Ascii> = format!("Bearer {token}").parse()?;
        request.metadata_mut().insert("authorization", value);
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let token = cli.token.as_deref();
    let channel = Channel::from_shared(cli.server.clone())?.connect().await?;

    match cli.command {
        Commands::Check {
            tenant,
            entity,
            permission,
            subject,
        } => {
            let (entity_type, entity_id) = split_ref(&entity)?;
            let (subject_type, subject_id) = split_ref(&subject)?;
            let mut client = PermissionClient::new(channel);

            let request = authorized(
                PermissionCheckRequest {
                    tenant_id: tenant,
                    metadata: Some(PermissionCheckRequestMetadata {
                        depth: 20,
                        ..Default::default()
                    }),
                    entity: Some(Entity {
                        r#type: entity_type,
                        id: entity_id,
                    }),
                    permission,
                    subject: Some(Subject {
                        r#type: subject_type,
                        id: subject_id,
                        relation: String::new(),
                    }),
                },
                token,
            )?;

            let start = Instant::now();
            let response = client.check(request).await?.into_inner();
            let result = CheckResult::try_from(response.can).unwrap_or(CheckResult::Unspecified);
            println!("{} ({:?})", result.as_str_name(), start.elapsed());
        }

        Commands::LookupEntity {
            tenant,
            entity_type,
            permission,
            subject,
        } => {
            let (subject_type, subject_id) = split_ref(&subject)?;
            let mut client = PermissionClient::new(channel);

            let request = authorized(
                PermissionLookupEntityRequest {
                    tenant_id: tenant,
                    metadata: Some(PermissionLookupEntityRequestMetadata {
                        depth: 20,
                        ..Default::default()
                    }),
                    entity_type,
                    permission,
                    subject: Some(Subject {
                        r#type: subject_type,
                        id: subject_id,
                        relation: String::new(),
                    }),
                    page_size: 0,
                    continuous_token: String::new(),
                },
                token,
            )?;

            let response = client.lookup_entity(request).await?.into_inner();
            if response.entity_ids.is_empty() {
                println!("No entities found");
            }
            for id in response.entity_ids {
                println!("{id}");
            }
        }

        Commands::Tenants => {
            let mut client = TenancyClient::new(channel);
            let request = authorized(TenantListRequest::default(), token)?;

            let response = client.list(request).await?.into_inner();
            println!("{:<32} {:<32} {}", "ID", "NAME", "CREATED");
            println!("{}", "=".repeat(80));
            for tenant in response.tenants {
                println!("{:<32} {:<32} {}", tenant.id, tenant.name, tenant.created_at);
            }
        }

        Commands::Health { service } => {
            let mut client = HealthClient::new(channel);
            let response = client
                .check(HealthCheckRequest {
                    service: service.clone(),
                })
                .await?
                .into_inner();
            let status = tonic_health::pb::health_check_response::ServingStatus::try_from(
                response.status,
            )
            .map(|s| s.as_str_name())
            .unwrap_or("UNKNOWN");
            let name = if service.is_empty() { "server" } else { &service };
            println!("{name}: {status}");
        }
    }

    Ok(())
}
