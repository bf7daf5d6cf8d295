//! Common test utilities shared across integration tests.
#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use permify_server::config::Config;
use permify_server::proto::{
    CheckResult, Entity, PermissionCheckRequest, PermissionCheckRequestMetadata,
    PermissionCheckResponse, PermissionCheckResponseMetadata, PermissionLookupEntityRequest,
    PermissionLookupEntityResponse, Subject,
};
use permify_server::{Container, Invoker, MemoryStore, ServerSet, ServiceError};
use permify_server::config::TlsSettings;
use tempfile::NamedTempFile;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};

/// Initialize test tracing (call once at the beginning of tests).
///
/// Only logs from this crate are shown, filtering out HTTP/2 and tower noise.
/// Subsequent calls are safe and will be ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new("permify_server=debug");

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();

    permify_server::tls::install_crypto_provider();
}

/// Loopback configuration with every listener on an ephemeral port.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.grpc.port = 0;
    config.server.http.port = 0;
    config.distributed.port = 0;
    config.profiler.port = 0;
    config.server.shutdown.rpc_grace_period_secs = 5;
    config
}

/// Container over a fresh in-memory store.
pub fn container() -> Container {
    Container::in_memory(Arc::new(MemoryStore::new()))
}

/// Starts a server set whose invoker shares the container's evaluator.
pub async fn start(config: &Config) -> ServerSet {
    let container = container();
    let local = Arc::clone(&container.invoker);
    container
        .start(config, local)
        .await
        .expect("server set starts")
}

/// Lazily connected channel to a gRPC server.
pub async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("connects to server")
}

/// Self-signed certificate on disk. The files live as long as this value.
pub struct TestCert {
    pub cert_pem: String,
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
}

impl TestCert {
    /// Certificate whose subject alternative names are exactly `names`.
    pub fn new(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        let cert_pem = certified.cert.pem();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert_pem.as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        Self {
            cert_pem,
            cert_file,
            key_file,
        }
    }

    /// Enabled TLS settings pointing at these files.
    pub fn settings(&self, server_name: &str) -> TlsSettings {
        TlsSettings {
            enabled: true,
            cert_path: self.cert_file.path().display().to_string(),
            key_path: self.key_file.path().display().to_string(),
            server_name: server_name.to_string(),
        }
    }
}

/// Channel to a TLS gRPC server, trusting `cert` and expecting it to name `domain`.
pub async fn tls_channel(addr: SocketAddr, cert: &TestCert, domain: &str) -> Channel {
    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&cert.cert_pem))
        .domain_name(domain);
    Channel::from_shared(format!("https://{addr}"))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .expect("connects over tls")
}

/// Well-formed check request against the default tenant.
pub fn check_request(entity_id: &str, subject_id: &str) -> PermissionCheckRequest {
    PermissionCheckRequest {
        tenant_id: "t1".to_string(),
        metadata: Some(PermissionCheckRequestMetadata {
            depth: 20,
            ..Default::default()
        }),
        entity: Some(Entity {
            r#type: "document".to_string(),
            id: entity_id.to_string(),
        }),
        permission: "view".to_string(),
        subject: Some(Subject {
            r#type: "user".to_string(),
            id: subject_id.to_string(),
            relation: String::new(),
        }),
    }
}

/// Evaluator that sleeps before allowing every check.
pub struct SlowInvoker {
    pub delay: std::time::Duration,
}

#[async_trait]
impl Invoker for SlowInvoker {
    async fn check(
        &self,
        _request: PermissionCheckRequest,
    ) -> Result<PermissionCheckResponse, ServiceError> {
        tokio::time::sleep(self.delay).await;
        Ok(PermissionCheckResponse {
            can: CheckResult::Allowed as i32,
            metadata: Some(PermissionCheckResponseMetadata { check_count: 1 }),
        })
    }

    async fn lookup_entity(
        &self,
        _request: PermissionLookupEntityRequest,
    ) -> Result<PermissionLookupEntityResponse, ServiceError> {
        tokio::time::sleep(self.delay).await;
        Ok(PermissionLookupEntityResponse::default())
    }
}

/// Evaluator that panics on every call.
pub struct PanickingInvoker;

#[async_trait]
impl Invoker for PanickingInvoker {
    async fn check(
        &self,
        _request: PermissionCheckRequest,
    ) -> Result<PermissionCheckResponse, ServiceError> {
        panic!("evaluator exploded");
    }

    async fn lookup_entity(
        &self,
        _request: PermissionLookupEntityRequest,
    ) -> Result<PermissionLookupEntityResponse, ServiceError> {
        panic!("evaluator exploded");
    }
}
