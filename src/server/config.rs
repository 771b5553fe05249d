use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::IN_MEMORY;

/// Default location of the TOML configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/server.toml";

/// Service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Storage location: a snapshot file path or `:memory:`.
    pub storage_path: String,
    /// Secret used to sign tokens and digest passwords.
    pub secret: String,
    /// Lifetime of access tokens, in seconds.
    pub access_token_ttl_secs: u64,
    /// Lifetime of refresh tokens, in seconds.
    pub refresh_token_ttl_secs: u64,
    /// gRPC listener settings.
    pub grpc: GrpcSettings,
    /// Metrics exporter configuration.
    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// gRPC listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrpcSettings {
    /// Hostname or IP address to bind to.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,
    /// Per-call network timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Log every request and response.
    #[serde(default)]
    pub request_logging: bool,
}

impl GrpcSettings {
    /// Converts host and port into a socket address.
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("{}:{} ({e})", self.host, self.port)))
    }

    /// Per-call network timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Metrics exporter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Whether metrics export is enabled.
    pub enabled: bool,
    /// Hostname or IP address for metrics server.
    pub host: String,
    /// Port number for metrics server.
    pub port: u16,
}

impl MetricsSettings {
    /// Converts host and port into a socket address for the metrics server.
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("{}:{} ({e})", self.host, self.port)))
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_path: IN_MEMORY.to_string(),
            secret: "insecure-development-secret".to_string(),
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 30 * 24 * 60 * 60,
            grpc: GrpcSettings {
                host: "127.0.0.1".to_string(),
                port: 50051,
                timeout_ms: 10_000,
                request_logging: false,
            },
            metrics: MetricsSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Lifetime of access tokens.
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Lifetime of refresh tokens.
    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }

    /// Loads configuration from `path`, overridden by `USERHUB_*` environment variables.
    ///
    /// Nested keys use a double underscore.
    ///
    /// # Environment Variable Examples
    /// ```bash
    /// USERHUB_STORAGE_PATH=/var/lib/userhub/userhub.json
    /// USERHUB_SECRET=s3cr3t
    /// USERHUB_GRPC__PORT=50052
    /// USERHUB_GRPC__REQUEST_LOGGING=true
    /// USERHUB_METRICS__ENABLED=true
    /// ```
    #[allow(clippy::result_large_err)]
    pub fn load(path: impl AsRef<Path>) -> figment::error::Result<Self> {
        use figment::providers::{Env, Format, Toml};
        use figment::Figment;

        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("USERHUB_").split("__"))
            .extract()
    }

    /// Rejects values the composition root cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.trim().is_empty() {
            return Err(Error::Config("storage_path cannot be empty".to_string()));
        }

        if self.secret.is_empty() {
            return Err(Error::Config("secret cannot be empty".to_string()));
        }

        if self.access_token_ttl_secs == 0 {
            return Err(Error::Config(
                "access_token_ttl_secs cannot be zero".to_string(),
            ));
        }

        if self.refresh_token_ttl_secs == 0 {
            return Err(Error::Config(
                "refresh_token_ttl_secs cannot be zero".to_string(),
            ));
        }

        if self.grpc.timeout_ms == 0 {
            return Err(Error::Config("grpc.timeout_ms cannot be zero".to_string()));
        }

        self.grpc.addr()?;

        if self.metrics.enabled {
            self.metrics.addr()?;
        }

        Ok(())
    }
}
