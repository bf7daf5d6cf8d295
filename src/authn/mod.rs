//! Authentication strategy selection.
//!
//! Exactly one strategy is active per process: none, preshared keys, or OIDC.
//! [`select`] resolves the configuration once at startup into an optional
//! [`Authenticator`] that the auth interceptor consults on every call.

use serde::{Deserialize, Serialize};
use tonic::Status;
use tracing::info;

use crate::error::{Error, Result};

pub mod oidc;
pub mod preshared;

pub use oidc::OidcAuthn;
pub use preshared::KeyAuthn;

/// Authentication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthnConfig {
    /// Whether calls must carry credentials.
    pub enabled: bool,
    /// Strategy name: `preshared` or `oidc`.
    pub method: String,
    /// Preshared key strategy.
    pub preshared: PresharedSettings,
    /// OIDC strategy.
    pub oidc: OidcSettings,
}

/// Preshared key settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PresharedSettings {
    /// Accepted bearer keys.
    pub keys: Vec<String>,
}

/// OIDC settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Issuer URL; discovery is fetched from `{issuer}/.well-known/openid-configuration`.
    pub issuer: String,
    /// Expected `aud` claim. Empty disables the audience check.
    pub audience: String,
    /// Seconds between background key set refreshes.
    pub refresh_interval_secs: u64,
    /// Accepted JWS algorithms, e.g. `RS256`.
    pub valid_methods: Vec<String>,
}

impl Default for AuthnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: "preshared".to_string(),
            preshared: PresharedSettings::default(),
            oidc: OidcSettings::default(),
        }
    }
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            refresh_interval_secs: 900,
            valid_methods: vec!["RS256".to_string()],
        }
    }
}

/// Resolved authentication strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthnStrategy {
    /// No authentication stage.
    Disabled,
    /// Bearer token must equal one of the configured keys.
    Preshared,
    /// Bearer token must be a JWT signed by the issuer.
    Oidc,
}

impl AuthnConfig {
    /// Resolves the configured strategy without building it.
    ///
    /// # Errors
    /// Returns [`Error::UnknownAuthnMethod`] when authentication is enabled with an
    /// unrecognized method name.
    pub fn strategy(&self) -> Result<AuthnStrategy> {
        if !self.enabled {
            return Ok(AuthnStrategy::Disabled);
        }
        match self.method.as_str() {
            "preshared" => Ok(AuthnStrategy::Preshared),
            "oidc" => Ok(AuthnStrategy::Oidc),
            other => Err(Error::UnknownAuthnMethod(other.to_string())),
        }
    }
}

/// Per-call credential failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthnError {
    /// No `authorization: Bearer` metadata.
    #[error("missing bearer credentials")]
    MissingCredentials,
    /// Bearer key is not one of the preshared keys.
    #[error("invalid preshared key")]
    InvalidKey,
    /// Token failed signature or claim validation.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token names a signing key the issuer does not publish.
    #[error("unknown signing key {0:?}")]
    UnknownKey(String),
}

impl From<AuthnError> for Status {
    fn from(err: AuthnError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

/// Credential validator for the active strategy.
#[derive(Clone)]
pub enum Authenticator {
    /// Preshared keys.
    Preshared(KeyAuthn),
    /// OIDC issuer.
    Oidc(OidcAuthn),
}

impl Authenticator {
    /// Checks a bearer credential.
    ///
    /// # Errors
    /// Returns why the credential was rejected.
    pub async fn validate(&self, credential: &str) -> std::result::Result<(), AuthnError> {
        match self {
            Authenticator::Preshared(keys) => keys.validate(credential),
            Authenticator::Oidc(oidc) => oidc.validate(credential).await,
        }
    }

    /// Strategy name for logs.
    pub fn strategy(&self) -> &'static str {
        match self {
            Authenticator::Preshared(_) => "preshared",
            Authenticator::Oidc(_) => "oidc",
        }
    }
}

/// Builds the authenticator for the configured strategy, or `None` when disabled.
///
/// # Errors
/// Fails on an unknown method, unusable key material, or an unreachable OIDC issuer.
pub async fn select(config: &AuthnConfig) -> Result<Option<Authenticator>> {
    let authenticator = match config.strategy()? {
        AuthnStrategy::Disabled => return Ok(None),
        AuthnStrategy::Preshared => Authenticator::Preshared(KeyAuthn::new(&config.preshared.keys)?),
        AuthnStrategy::Oidc => Authenticator::Oidc(OidcAuthn::discover(&config.oidc).await?),
    };
    info!(strategy = authenticator.strategy(), "authentication enabled");
    Ok(Some(authenticator))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(method: &str) -> AuthnConfig {
        AuthnConfig {
            enabled: true,
            method: method.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_ignores_method() {
        let config = AuthnConfig {
            enabled: false,
            method: "kerberos".to_string(),
            ..Default::default()
        };

        assert_eq!(config.strategy().unwrap(), AuthnStrategy::Disabled);
    }

    #[test]
    fn resolves_known_methods() {
        assert_eq!(enabled("preshared").strategy().unwrap(), AuthnStrategy::Preshared);
        assert_eq!(enabled("oidc").strategy().unwrap(), AuthnStrategy::Oidc);
    }

    #[test]
    fn rejects_unknown_method() {
        let err = enabled("kerberos").strategy().unwrap_err();
        assert!(matches!(err, Error::UnknownAuthnMethod(m) if m == "kerberos"));
    }

    #[tokio::test]
    async fn select_disabled_yields_nothing() {
        assert!(select(&AuthnConfig::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_preshared_requires_keys() {
        let err = select(&enabled("preshared")).await.err().unwrap();
        assert!(matches!(err, Error::AuthnConfig(_)));

        let mut config = enabled("preshared");
        config.preshared.keys = vec!["k1".to_string()];
        let authn = select(&config).await.unwrap().unwrap();
        assert_eq!(authn.strategy(), "preshared");
        assert!(authn.validate("k1").await.is_ok());
        assert_eq!(authn.validate("k2").await, Err(AuthnError::InvalidKey));
    }

    #[tokio::test]
    async fn select_oidc_requires_issuer() {
        let err = select(&enabled("oidc")).await.err().unwrap();
        assert!(matches!(err, Error::AuthnConfig(_)));
    }

    #[test]
    fn authn_errors_are_unauthenticated() {
        let status = Status::from(AuthnError::InvalidKey);
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }
}
