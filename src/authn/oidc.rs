//! OIDC bearer token validation.
//!
//! The issuer's discovery document and key set are fetched once at startup.
//! A background task refreshes the key set periodically, and a token naming an
//! unknown `kid` triggers one immediate refresh before it is rejected.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::{AuthnError, OidcSettings};
use crate::error::{Error, Result};

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: Option<String>,
}

struct Inner {
    issuer: String,
    audience: String,
    algorithms: Vec<Algorithm>,
    jwks_uri: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    refresh_lock: Mutex<()>,
}

/// Validates JWTs issued by an OIDC provider.
///
/// Clones share the key cache. The refresh task stops once the last clone is dropped.
#[derive(Clone)]
pub struct OidcAuthn {
    inner: Arc<Inner>,
    _refresh: Arc<DropGuard>,
}

impl OidcAuthn {
    /// Fetches issuer metadata and keys, then starts the refresh task.
    ///
    /// # Errors
    /// Fails when the settings are incomplete or the issuer cannot be reached.
    pub async fn discover(settings: &OidcSettings) -> Result<Self> {
        if settings.issuer.is_empty() {
            return Err(Error::AuthnConfig("oidc issuer is required".to_string()));
        }

        let algorithms = settings
            .valid_methods
            .iter()
            .map(|m| {
                Algorithm::from_str(m)
                    .map_err(|_| Error::AuthnConfig(format!("unsupported oidc algorithm {m:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if algorithms.is_empty() {
            return Err(Error::AuthnConfig(
                "oidc valid_methods must not be empty".to_string(),
            ));
        }

        crate::tls::install_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::AuthnConfig(format!("failed to create http client: {e}")))?;

        let issuer = settings.issuer.trim_end_matches('/').to_string();
        let discovery_err = |reason: String| Error::OidcDiscovery {
            issuer: issuer.clone(),
            reason,
        };

        let discovery: Discovery = client
            .get(format!("{issuer}{DISCOVERY_PATH}"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| discovery_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| discovery_err(format!("malformed discovery document: {e}")))?;

        if discovery.issuer.trim_end_matches('/') != issuer {
            return Err(discovery_err(format!(
                "discovery document names issuer {:?}",
                discovery.issuer
            )));
        }

        let inner = Arc::new(Inner {
            issuer: issuer.clone(),
            audience: settings.audience.clone(),
            algorithms,
            jwks_uri: discovery.jwks_uri,
            client,
            keys: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        });
        inner.refresh().await.map_err(discovery_err)?;

        let cancel = CancellationToken::new();
        if settings.refresh_interval_secs > 0 {
            spawn_refresh(
                &inner,
                Duration::from_secs(settings.refresh_interval_secs),
                cancel.clone(),
            );
        }

        Ok(Self {
            inner,
            _refresh: Arc::new(cancel.drop_guard()),
        })
    }

    /// Validates signature, algorithm, issuer, audience and expiry of a token.
    ///
    /// # Errors
    /// Returns why the token was rejected.
    pub async fn validate(&self, token: &str) -> std::result::Result<(), AuthnError> {
        let header = decode_header(token).map_err(|e| AuthnError::InvalidToken(e.to_string()))?;
        if !self.inner.algorithms.contains(&header.alg) {
            return Err(AuthnError::InvalidToken(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let kid = header.kid.unwrap_or_default();
        let key = match self.inner.key(&kid).await {
            Some(key) => key,
            None => {
                debug!(kid = %kid, "unknown signing key, refreshing key set");
                if let Err(reason) = self.inner.refresh().await {
                    warn!(issuer = %self.inner.issuer, %reason, "key set refresh failed");
                }
                self.inner
                    .key(&kid)
                    .await
                    .ok_or_else(|| AuthnError::UnknownKey(kid.clone()))?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.inner.issuer]);
        if self.inner.audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&[&self.inner.audience]);
        }

        decode::<Claims>(token, &key, &validation)
            .map(|_| ())
            .map_err(|e| AuthnError::InvalidToken(e.to_string()))
    }

    /// Issuer the tokens must name.
    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }
}

impl Inner {
    async fn key(&self, kid: &str) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        keys.get(kid).cloned().or_else(|| {
            // A token without `kid` is accepted against a single published key.
            (kid.is_empty() && keys.len() == 1)
                .then(|| keys.values().next().cloned())
                .flatten()
        })
    }

    async fn refresh(&self) -> std::result::Result<(), String> {
        let _guard = self.refresh_lock.lock().await;

        let set: JwkSet = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| format!("key set fetch failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("malformed key set: {e}"))?;

        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let kid = jwk.common.key_id.clone().unwrap_or_default();
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, error = %e, "skipping unusable signing key"),
            }
        }

        debug!(jwks_uri = %self.jwks_uri, count = keys.len(), "key set refreshed");
        *self.keys.write().await = keys;
        Ok(())
    }
}

fn spawn_refresh(inner: &Arc<Inner>, period: Duration, cancel: CancellationToken) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    if let Err(reason) = inner.refresh().await {
                        warn!(issuer = %inner.issuer, %reason, "periodic key set refresh failed");
                    }
                }
            }
        }
    });
}
