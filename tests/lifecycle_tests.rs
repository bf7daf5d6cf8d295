mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use permify_server::middleware::{InterceptorChain, RateLimiter};
use permify_server::proto::data_client::DataClient;
use permify_server::proto::permission_client::PermissionClient;
use permify_server::proto::schema_client::SchemaClient;
use permify_server::proto::watch_client::WatchClient;
use permify_server::proto::{
    CheckResult, DataWriteRequest, DataWriteRequestMetadata, Entity, SchemaReadRequest,
    SchemaReadRequestMetadata, Subject, Tuple, WatchRequest,
};
use permify_server::servers::RpcServer;
use permify_server::{Error, LifecycleState, ServerEvent, ServerKind};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use common::{check_request, init_tracing, test_config, SlowInvoker};

#[tokio::test]
async fn unknown_authn_method_fails_before_binding() {
    init_tracing();

    // Holding the primary port would make any bind attempt fail with a bind error.
    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.server.grpc.port = held.local_addr().unwrap().port();
    config.authn.enabled = true;
    config.authn.method = "kerberos".to_string();

    let container = common::container();
    let local = Arc::clone(&container.invoker);
    let err = container.start(&config, local).await.err().unwrap();

    assert!(
        matches!(&err, Error::UnknownAuthnMethod(m) if m == "kerberos"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn invalid_preshared_keys_fail_before_binding() {
    init_tracing();

    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.server.grpc.port = held.local_addr().unwrap().port();
    config.authn.enabled = true;
    config.authn.method = "preshared".to_string();
    config.authn.preshared.keys = vec![String::new()];

    let container = common::container();
    let local = Arc::clone(&container.invoker);
    let err = container.start(&config, local).await.err().unwrap();

    assert!(matches!(err, Error::AuthnConfig(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn bind_failure_releases_opened_listeners() {
    init_tracing();

    let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let primary_port = free.local_addr().unwrap().port();
    drop(free);
    let held = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = test_config();
    config.server.grpc.port = primary_port;
    config.distributed.port = held.local_addr().unwrap().port();

    let container = common::container();
    let local = Arc::clone(&container.invoker);
    let err = container.start(&config, local).await.err().unwrap();

    assert!(
        matches!(err, Error::Bind { server: ServerKind::Invoker, .. }),
        "unexpected error: {err}"
    );
    // The primary listener was opened first and must be free again.
    TcpListener::bind(("127.0.0.1", primary_port))
        .await
        .expect("primary port released");
}

#[tokio::test]
async fn start_reports_bound_addresses() {
    init_tracing();

    let mut config = test_config();
    config.profiler.enabled = true;
    let mut servers = common::start(&config).await;

    assert_eq!(servers.state(), LifecycleState::Serving);
    assert_ne!(servers.primary_addr().port(), 0);
    assert_ne!(servers.invoker_addr().port(), 0);
    assert!(servers.http_addr().is_some());
    assert!(servers.profiler_addr().is_some());
    assert_eq!(servers.rate_limiter().rate(), config.server.rate_limit);

    servers.shutdown().await.unwrap();
}

#[tokio::test]
async fn gateway_disabled_binds_no_http_listener() {
    init_tracing();

    let mut config = test_config();
    config.server.http.enabled = false;
    let mut servers = common::start(&config).await;

    assert!(servers.http_addr().is_none());
    assert!(servers.profiler_addr().is_none());

    servers.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_twice_is_a_noop() {
    init_tracing();

    let mut servers = common::start(&test_config()).await;

    servers.shutdown().await.unwrap();
    assert_eq!(servers.state(), LifecycleState::Stopped);

    servers.shutdown().await.unwrap();
    assert_eq!(servers.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn invoker_serves_permission_api_only() {
    init_tracing();

    let mut servers = common::start(&test_config()).await;
    let channel = common::channel(servers.invoker_addr()).await;

    let response = PermissionClient::new(channel.clone())
        .check(check_request("1", "alice"))
        .await
        .expect("permission api is served")
        .into_inner();
    assert_eq!(response.can, CheckResult::Denied as i32);

    let status = SchemaClient::new(channel)
        .read(SchemaReadRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(SchemaReadRequestMetadata::default()),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    servers.shutdown().await.unwrap();
}

#[tokio::test]
async fn invoker_serves_checks_without_a_primary() {
    init_tracing();

    let container = common::container();
    let chain = InterceptorChain::compose(RateLimiter::new(100), None);
    let server = RpcServer::invoker(Arc::clone(&container.invoker), chain, None)
        .await
        .unwrap();
    assert_eq!(server.kind(), ServerKind::Invoker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(listener, shutdown.clone()));

    let response = PermissionClient::new(common::channel(addr).await)
        .check(check_request("1", "alice"))
        .await
        .expect("invoker answers on its own")
        .into_inner();
    assert_eq!(response.can, CheckResult::Denied as i32);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn primary_serves_full_api() {
    init_tracing();

    let mut servers = common::start(&test_config()).await;
    let channel = common::channel(servers.primary_addr()).await;

    let status = SchemaClient::new(channel)
        .read(SchemaReadRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(SchemaReadRequestMetadata::default()),
        })
        .await
        .unwrap_err();
    // Reached the handler: no schema has been written yet.
    assert_eq!(status.code(), Code::NotFound);

    servers.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_gateway_before_rpc_servers() {
    init_tracing();

    let config = test_config();
    let mut container = common::container();
    container.invoker = Arc::new(SlowInvoker {
        delay: Duration::from_millis(500),
    });
    let local = Arc::clone(&container.invoker);
    let mut servers = container.start(&config, local).await.unwrap();
    let mut events = servers.subscribe();

    let url = format!(
        "http://{}/v1/tenants/t1/permissions/check",
        servers.http_addr().unwrap()
    );
    let in_flight = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .json(&serde_json::json!({
                "metadata": { "depth": 20 },
                "entity": { "type": "document", "id": "1" },
                "permission": "view",
                "subject": { "type": "user", "id": "alice" }
            }))
            .send()
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    servers.shutdown().await.unwrap();

    let response = in_flight.await.unwrap().expect("in-flight request completes");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["can"], "CHECK_RESULT_ALLOWED");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let position = |wanted: &ServerEvent| {
        seen.iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("missing {wanted:?} in {seen:?}"))
    };

    let gateway_stopping = position(&ServerEvent::Stopping {
        server: ServerKind::Gateway,
    });
    let gateway_stopped = position(&ServerEvent::Stopped {
        server: ServerKind::Gateway,
    });
    let primary_stopping = position(&ServerEvent::Stopping {
        server: ServerKind::Primary,
    });
    let invoker_stopping = position(&ServerEvent::Stopping {
        server: ServerKind::Invoker,
    });

    assert!(gateway_stopping < gateway_stopped);
    assert!(gateway_stopped < primary_stopping);
    assert!(gateway_stopped < invoker_stopping);
    assert_eq!(servers.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn shutdown_ends_open_watch_streams() {
    init_tracing();

    let mut config = test_config();
    config.server.shutdown.rpc_grace_period_secs = 2;
    let mut servers = common::start(&config).await;
    let channel = common::channel(servers.primary_addr()).await;

    let mut changes = WatchClient::new(channel.clone())
        .watch(WatchRequest {
            tenant_id: "t1".to_string(),
            snap_token: String::new(),
        })
        .await
        .unwrap()
        .into_inner();

    DataClient::new(channel)
        .write(DataWriteRequest {
            tenant_id: "t1".to_string(),
            metadata: Some(DataWriteRequestMetadata::default()),
            tuples: vec![Tuple {
                entity: Some(Entity {
                    r#type: "document".to_string(),
                    id: "1".to_string(),
                }),
                relation: "view".to_string(),
                subject: Some(Subject {
                    r#type: "user".to_string(),
                    id: "alice".to_string(),
                    relation: String::new(),
                }),
            }],
        })
        .await
        .unwrap();
    let first = changes.message().await.unwrap().expect("one change set");
    assert_eq!(first.changes.unwrap().data_changes.len(), 1);

    let started = Instant::now();
    servers.shutdown().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "shutdown waited on the watch stream: {:?}",
        started.elapsed()
    );
    assert_eq!(servers.state(), LifecycleState::Stopped);

    // The stream was closed by the server, not left waiting for more changes.
    assert!(!matches!(changes.message().await, Ok(Some(_))));
}

#[tokio::test]
async fn run_returns_after_cancellation() {
    init_tracing();

    let config = test_config();
    let container = common::container();
    let local = Arc::clone(&container.invoker);
    let shutdown = tokio_util::sync::CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    tokio::time::timeout(
        Duration::from_secs(10),
        container.run(shutdown, &config, local),
    )
    .await
    .expect("run returns after cancellation")
    .unwrap();
}
