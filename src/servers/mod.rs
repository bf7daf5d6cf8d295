//! gRPC services, the two RPC servers, and the container that starts everything.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::{Server, ServerTlsConfig};
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::invoke::{DirectInvoker, Invoker};
use crate::middleware::InterceptorChain;
use crate::proto::data_server::DataServer;
use crate::proto::permission_server::PermissionServer;
use crate::proto::schema_server::SchemaServer;
use crate::proto::tenancy_server::TenancyServer;
use crate::proto::watch_server::WatchServer;
use crate::storage::{
    DataReader, DataWriter, MemoryStore, SchemaReader, SchemaWriter, TenantReader, TenantWriter,
    Watcher,
};
use crate::tls::TlsCredentials;

pub mod data;
pub mod lifecycle;
pub mod permission;
pub mod schema;
pub mod tenancy;
pub mod watch;

pub use data::DataService;
pub use lifecycle::{LifecycleState, ServerEvent, ServerKind, ServerSet};
pub use permission::PermissionService;
pub use schema::SchemaService;
pub use tenancy::TenancyService;
pub use watch::WatchService;

/// Collaborators served by the primary server.
#[derive(Clone)]
pub struct Container {
    /// Permission evaluator behind the primary server.
    pub invoker: Arc<dyn Invoker>,
    /// Relationship reads.
    pub data_reader: Arc<dyn DataReader>,
    /// Relationship writes.
    pub data_writer: Arc<dyn DataWriter>,
    /// Schema reads.
    pub schema_reader: Arc<dyn SchemaReader>,
    /// Schema writes.
    pub schema_writer: Arc<dyn SchemaWriter>,
    /// Tenant listing.
    pub tenant_reader: Arc<dyn TenantReader>,
    /// Tenant creation and deletion.
    pub tenant_writer: Arc<dyn TenantWriter>,
    /// Change feed.
    pub watcher: Arc<dyn Watcher>,
}

impl Container {
    /// Wires every collaborator to one in-memory store, with a direct-lookup evaluator.
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            invoker: Arc::new(DirectInvoker::new(store.clone())),
            data_reader: store.clone(),
            data_writer: store.clone(),
            schema_reader: store.clone(),
            schema_writer: store.clone(),
            tenant_reader: store.clone(),
            tenant_writer: store.clone(),
            watcher: store,
        }
    }

    /// Binds and starts every configured server and returns once all are serving.
    ///
    /// `local_invoker` backs the invoker server. Nothing is bound if configuration,
    /// authentication or TLS setup fails, and anything already started is torn
    /// down if a later listener cannot be acquired.
    ///
    /// # Errors
    /// Returns the first startup failure.
    pub async fn start(
        &self,
        config: &Config,
        local_invoker: Arc<dyn Invoker>,
    ) -> Result<ServerSet> {
        ServerSet::start(self, config, local_invoker).await
    }

    /// Starts every server, waits for `shutdown`, then stops them in order.
    ///
    /// # Errors
    /// Returns a startup failure, or a shutdown error naming every step that failed.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        config: &Config,
        local_invoker: Arc<dyn Invoker>,
    ) -> Result<()> {
        let mut servers = self.start(config, local_invoker).await?;
        shutdown.cancelled().await;
        info!("shutdown requested");
        servers.shutdown().await
    }
}

/// A configured tonic server waiting for its listener.
pub struct RpcServer {
    kind: ServerKind,
    routes: Routes,
    tls: Option<ServerTlsConfig>,
    health: HealthReporter,
    services: Vec<&'static str>,
    drain: CancellationToken,
}

impl RpcServer {
    /// Full API surface: permission, schema, data, tenancy and watch, plus health and reflection.
    ///
    /// # Errors
    /// Fails if the reflection service cannot be built.
    pub async fn primary(
        container: &Container,
        chain: InterceptorChain,
        tls: Option<&TlsCredentials>,
    ) -> Result<Self> {
        let (health, health_service) = health_reporter();
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::proto::FILE_DESCRIPTOR_SET)
            .build_v1()?;
        let drain = CancellationToken::new();

        let permission = PermissionServer::new(PermissionService::new(
            Arc::clone(&container.invoker),
            chain.clone(),
        ));
        let schema = SchemaServer::new(SchemaService::new(
            Arc::clone(&container.schema_reader),
            Arc::clone(&container.schema_writer),
            chain.clone(),
        ));
        let data = DataServer::new(DataService::new(
            Arc::clone(&container.data_reader),
            Arc::clone(&container.data_writer),
            chain.clone(),
        ));
        let tenancy = TenancyServer::new(TenancyService::new(
            Arc::clone(&container.tenant_reader),
            Arc::clone(&container.tenant_writer),
            chain.clone(),
        ));
        let watch = WatchServer::new(WatchService::new(
            Arc::clone(&container.watcher),
            chain,
            drain.clone(),
        ));

        let services = vec![
            PermissionServer::<PermissionService>::NAME,
            SchemaServer::<SchemaService>::NAME,
            DataServer::<DataService>::NAME,
            TenancyServer::<TenancyService>::NAME,
            WatchServer::<WatchService>::NAME,
        ];
        let routes = Routes::new(health_service)
            .add_service(reflection)
            .add_service(permission)
            .add_service(schema)
            .add_service(data)
            .add_service(tenancy)
            .add_service(watch);

        Ok(Self::assemble(ServerKind::Primary, routes, tls, health, services, drain).await)
    }

    /// Permission API only, bound to a local evaluator, plus health and reflection.
    ///
    /// # Errors
    /// Fails if the reflection service cannot be built.
    pub async fn invoker(
        invoker: Arc<dyn Invoker>,
        chain: InterceptorChain,
        tls: Option<&TlsCredentials>,
    ) -> Result<Self> {
        let (health, health_service) = health_reporter();
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::proto::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let permission = PermissionServer::new(PermissionService::new(invoker, chain));
        let routes = Routes::new(health_service)
            .add_service(reflection)
            .add_service(permission);

        Ok(Self::assemble(
            ServerKind::Invoker,
            routes,
            tls,
            health,
            vec![PermissionServer::<PermissionService>::NAME],
            CancellationToken::new(),
        )
        .await)
    }

    async fn assemble(
        kind: ServerKind,
        routes: Routes,
        tls: Option<&TlsCredentials>,
        mut health: HealthReporter,
        services: Vec<&'static str>,
        drain: CancellationToken,
    ) -> Self {
        for name in &services {
            health
                .set_service_status(*name, ServingStatus::Serving)
                .await;
        }

        Self {
            kind,
            routes,
            tls: tls.map(TlsCredentials::server_tls_config),
            health,
            services,
            drain,
        }
    }

    /// Which server this is.
    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    /// Health reporter of this server.
    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    /// Serves on `listener` until `shutdown` fires, then drains in-flight calls.
    ///
    /// Health flips to `NOT_SERVING` and open watch streams end as soon as the drain
    /// starts.
    ///
    /// # Errors
    /// Fails if TLS cannot be applied or the transport stops with an error.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut builder = Server::builder();
        if let Some(tls) = self.tls {
            builder = builder.tls_config(tls)?;
        }

        let kind = self.kind;
        let mut health = self.health;
        let services = self.services;
        let drain = self.drain;
        let signal = async move {
            shutdown.cancelled().await;
            info!(server = %kind, "graceful stop started");
            drain.cancel();
            health
                .set_service_status("", ServingStatus::NotServing)
                .await;
            for name in services {
                health
                    .set_service_status(name, ServingStatus::NotServing)
                    .await;
            }
        };

        builder
            .add_routes(self.routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;
        Ok(())
    }
}
