mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use permify_server::authn::{self, AuthnConfig, AuthnError, OidcAuthn, OidcSettings};
use permify_server::proto::tenancy_client::TenancyClient;
use permify_server::proto::TenantListRequest;
use permify_server::Error;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tonic::{Code, Request};

use common::{init_tracing, test_config};

const SECRET: &[u8] = b"permify-gateway-oidc-test-secret!";
const SECRET_B64: &str = "cGVybWlmeS1nYXRld2F5LW9pZGMtdGVzdC1zZWNyZXQh";
const KID: &str = "test-key-1";
const AUDIENCE: &str = "permify";

#[derive(Clone)]
struct Issuer {
    base: String,
    jwks_fetches: Arc<AtomicUsize>,
}

async fn discovery(State(issuer): State<Issuer>) -> Json<Value> {
    Json(json!({
        "issuer": issuer.base,
        "jwks_uri": format!("{}/jwks", issuer.base),
    }))
}

async fn jwks(State(issuer): State<Issuer>) -> Json<Value> {
    issuer.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "keys": [{ "kty": "oct", "kid": KID, "alg": "HS256", "k": SECRET_B64 }]
    }))
}

/// Serves a discovery document and a single symmetric signing key.
async fn mock_issuer() -> Issuer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let issuer = Issuer {
        base: format!("http://{addr}"),
        jwks_fetches: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/jwks", get(jwks))
        .with_state(issuer.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    issuer
}

fn oidc_settings(issuer: &Issuer) -> OidcSettings {
    OidcSettings {
        issuer: issuer.base.clone(),
        audience: AUDIENCE.to_string(),
        refresh_interval_secs: 0,
        valid_methods: vec!["HS256".to_string()],
    }
}

fn token(issuer: &str, kid: &str, expires_in: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    let claims = json!({
        "sub": "alice",
        "iss": issuer,
        "aud": AUDIENCE,
        "iat": now,
        "exp": now + expires_in,
    });
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

#[tokio::test]
async fn oidc_accepts_tokens_signed_by_the_issuer() {
    init_tracing();

    let issuer = mock_issuer().await;
    let authn = OidcAuthn::discover(&oidc_settings(&issuer)).await.unwrap();

    assert_eq!(authn.issuer(), issuer.base);
    assert!(authn.validate(&token(&issuer.base, KID, 300)).await.is_ok());
}

#[tokio::test]
async fn oidc_rejects_expired_and_foreign_tokens() {
    init_tracing();

    let issuer = mock_issuer().await;
    let authn = OidcAuthn::discover(&oidc_settings(&issuer)).await.unwrap();

    let expired = token(&issuer.base, KID, -3600);
    assert!(matches!(
        authn.validate(&expired).await,
        Err(AuthnError::InvalidToken(_))
    ));

    let foreign = token("https://elsewhere.example", KID, 300);
    assert!(matches!(
        authn.validate(&foreign).await,
        Err(AuthnError::InvalidToken(_))
    ));

    assert!(matches!(
        authn.validate("not-a-jwt").await,
        Err(AuthnError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn unknown_kid_triggers_one_refresh() {
    init_tracing();

    let issuer = mock_issuer().await;
    let authn = OidcAuthn::discover(&oidc_settings(&issuer)).await.unwrap();
    assert_eq!(issuer.jwks_fetches.load(Ordering::SeqCst), 1);

    let rotated = token(&issuer.base, "rotated-key", 300);
    assert_eq!(
        authn.validate(&rotated).await,
        Err(AuthnError::UnknownKey("rotated-key".to_string()))
    );
    assert_eq!(issuer.jwks_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn issuer_mismatch_fails_discovery() {
    init_tracing();

    let issuer = mock_issuer().await;
    let mut settings = oidc_settings(&issuer);
    settings.issuer = issuer.base.replace("127.0.0.1", "localhost");

    let err = OidcAuthn::discover(&settings).await.err().unwrap();
    assert!(matches!(err, Error::OidcDiscovery { .. }), "{err}");
}

#[tokio::test]
async fn select_builds_the_configured_strategy() {
    init_tracing();

    let issuer = mock_issuer().await;
    let config = AuthnConfig {
        enabled: true,
        method: "oidc".to_string(),
        oidc: oidc_settings(&issuer),
        ..Default::default()
    };

    let authenticator = authn::select(&config).await.unwrap().unwrap();
    assert_eq!(authenticator.strategy(), "oidc");
}

#[tokio::test]
async fn oidc_guards_the_primary_server() {
    init_tracing();

    let issuer = mock_issuer().await;
    let mut config = test_config();
    config.authn.enabled = true;
    config.authn.method = "oidc".to_string();
    config.authn.oidc = oidc_settings(&issuer);
    let mut servers = common::start(&config).await;

    let mut client = TenancyClient::new(common::channel(servers.primary_addr()).await);

    let status = client
        .list(TenantListRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);

    let mut request = Request::new(TenantListRequest::default());
    request.metadata_mut().insert(
        "authorization",
        format!("Bearer {}", token(&issuer.base, KID, 300))
            .parse()
            .unwrap(),
    );
    let tenants = client.list(request).await.unwrap().into_inner().tenants;
    assert!(tenants.iter().any(|t| t.id == "t1"));

    let http = servers.http_addr().unwrap();
    let response = reqwest::Client::new()
        .post(format!("http://{http}/v1/tenants/list"))
        .bearer_auth(token(&issuer.base, KID, 300))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    servers.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_issuer_fails_startup() {
    init_tracing();

    let mut config = test_config();
    config.authn.enabled = true;
    config.authn.method = "oidc".to_string();
    config.authn.oidc.issuer = "http://127.0.0.1:1".to_string();

    let container = common::container();
    let local = Arc::clone(&container.invoker);
    let err = container.start(&config, local).await.err().unwrap();
    assert!(matches!(err, Error::OidcDiscovery { .. }), "{err}");
}
