use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authn::AuthnConfig;
use crate::error::{Error, Result};

/// Process configuration. Immutable once the server set is started.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Primary gRPC and HTTP gateway settings.
    pub server: ServerSettings,
    /// Invoker endpoint settings.
    pub distributed: DistributedSettings,
    /// Authentication strategy.
    pub authn: AuthnConfig,
    /// Profiling sidecar.
    pub profiler: ProfilerSettings,
    /// Log output.
    pub log: LogSettings,
}

/// Settings shared by the primary gRPC server and the HTTP gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Interface every listener binds to.
    pub host: String,
    /// Requests per second admitted across both gRPC servers.
    pub rate_limit: u64,
    /// Primary gRPC server.
    pub grpc: GrpcSettings,
    /// HTTP/JSON gateway.
    pub http: HttpSettings,
    /// Shutdown bounds.
    pub shutdown: ShutdownSettings,
}

/// Primary gRPC listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    /// Port number, `0` for an ephemeral port.
    pub port: u16,
    /// TLS for both gRPC servers.
    pub tls: TlsSettings,
}

/// HTTP gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Whether the gateway is started at all.
    pub enabled: bool,
    /// Port number, `0` for an ephemeral port.
    pub port: u16,
    /// TLS for the HTTP listener, independent of the gRPC one.
    pub tls: TlsSettings,
    /// Allowed CORS origins. `*` mirrors the request origin.
    pub cors_allowed_origins: Vec<String>,
    /// Allowed CORS request headers. `*` mirrors the requested headers.
    pub cors_allowed_headers: Vec<String>,
}

/// TLS configuration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Whether TLS is enabled.
    pub enabled: bool,
    /// Path to TLS certificate file (PEM format).
    pub cert_path: String,
    /// Path to TLS private key file (PEM format).
    pub key_path: String,
    /// Name checked against the certificate when the gateway dials the primary server
    /// over loopback.
    pub server_name: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: String::new(),
            key_path: String::new(),
            server_name: "localhost".to_string(),
        }
    }
}

/// Bounds applied while the server set shuts down.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Seconds the gateway gets to drain before it is abandoned.
    pub http_timeout_secs: u64,
    /// Seconds each gRPC server gets to drain before it is aborted. `0` waits forever.
    pub rpc_grace_period_secs: u64,
}

/// Invoker endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedSettings {
    /// Port number, `0` for an ephemeral port.
    pub port: u16,
}

/// Profiling sidecar settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerSettings {
    /// Whether the sidecar is started.
    pub enabled: bool,
    /// Port number, `0` for an ephemeral port.
    pub port: u16,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output encoding.
    pub format: LogFormat,
}

/// Log line encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            rate_limit: 10_000,
            grpc: GrpcSettings::default(),
            http: HttpSettings::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            port: 3478,
            tls: TlsSettings::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3476,
            tls: TlsSettings::default(),
            cors_allowed_origins: vec!["*".to_string()],
            cors_allowed_headers: vec!["*".to_string()],
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: 5,
            rpc_grace_period_secs: 30,
        }
    }
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 6060,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl ShutdownSettings {
    /// Bound on gateway shutdown.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Bound on each gRPC server's graceful stop, `None` when unbounded.
    pub fn rpc_grace_period(&self) -> Option<Duration> {
        (self.rpc_grace_period_secs > 0).then(|| Duration::from_secs(self.rpc_grace_period_secs))
    }
}

impl Config {
    /// Loads configuration from `.env` file, TOML file, and environment variables.
    ///
    /// Configuration priority (highest to lowest):
    /// 1. Environment variables with `PERMIFY_` prefix, `__` between sections
    ///    (e.g., `PERMIFY_SERVER__GRPC__PORT=3478`)
    /// 2. TOML configuration file (if exists)
    /// 3. `.env` file (if exists)
    /// 4. Built-in defaults
    ///
    /// The TOML file path can be set via `PERMIFY_CONFIG_PATH`. If not set, defaults to
    /// `./config/server.toml`. A missing file is silently skipped.
    ///
    /// # Errors
    /// Returns an error if the configuration is malformed.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config_path = std::env::var("PERMIFY_CONFIG_PATH")
            .unwrap_or_else(|_| "config/server.toml".to_string());

        Self::load(&config_path)
    }

    /// Loads configuration from defaults, the given TOML file and `PERMIFY_` variables.
    ///
    /// # Errors
    /// Returns an error if the configuration is malformed.
    pub fn load(config_path: &str) -> Result<Self> {
        use figment::providers::{Env, Format, Serialized, Toml};
        use figment::Figment;

        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("PERMIFY_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Address a listener on `port` binds to.
    ///
    /// # Errors
    /// Returns an error if `server.host` is not an IP address.
    pub fn bind_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("invalid host {:?}: {e}", self.server.host)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Validates the configuration before anything is bound.
    ///
    /// # Errors
    /// Returns an error message describing the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        check_tls("server.grpc.tls", &self.server.grpc.tls)?;
        if self.server.http.enabled {
            check_tls("server.http.tls", &self.server.http.tls)?;
        }

        if self.server.rate_limit == 0 {
            return Err("server.rate_limit cannot be zero".to_string());
        }

        if self.authn.enabled
            && self.authn.method == "preshared"
            && self.authn.preshared.keys.is_empty()
        {
            return Err("authn.preshared.keys cannot be empty".to_string());
        }

        if self.server.http.enabled && self.server.shutdown.http_timeout_secs == 0 {
            return Err("server.shutdown.http_timeout_secs cannot be zero".to_string());
        }

        let mut ports = vec![
            ("server.grpc.port", self.server.grpc.port),
            ("distributed.port", self.distributed.port),
        ];
        if self.server.http.enabled {
            ports.push(("server.http.port", self.server.http.port));
        }
        if self.profiler.enabled {
            ports.push(("profiler.port", self.profiler.port));
        }

        let mut seen = HashSet::new();
        for (name, port) in ports {
            if port != 0 && !seen.insert(port) {
                return Err(format!("{name} {port} is already used by another listener"));
            }
        }

        Ok(())
    }
}

fn check_tls(section: &str, tls: &TlsSettings) -> std::result::Result<(), String> {
    if tls.enabled {
        if tls.cert_path.is_empty() {
            return Err(format!("{section} is enabled but cert_path is empty"));
        }
        if tls.key_path.is_empty() {
            return Err(format!("{section} is enabled but key_path is empty"));
        }
        if tls.server_name.is_empty() {
            return Err(format!("{section} is enabled but server_name is empty"));
        }
    }
    Ok(())
}
