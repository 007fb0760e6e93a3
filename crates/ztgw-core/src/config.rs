//! Configuration for the zero-trust gateway daemon.
//!
//! Provides file discovery (CLI flag, env var, standard paths), TOML
//! parsing with serde, and environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum GatewayConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type GatewayConfigResult<T> = Result<T, GatewayConfigError>;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub gateway: GatewaySettings,
    pub resolver: ResolverSettings,
    pub proxy: ProxySettings,
    pub api: ApiSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            resolver: ResolverSettings::default(),
            proxy: ProxySettings::default(),
            api: ApiSettings::default(),
        }
    }
}

/// Top-level gateway identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Directory holding `certs/` and `data/` (spec §6 persisted-state layout).
    pub data_dir: PathBuf,
    /// Externally-visible address of the gateway, embedded as a SAN on the
    /// server certificate and returned in private-zone A answers.
    pub external_addr: IpAddr,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: default_data_dir(),
            external_addr: IpAddr::from([127, 0, 0, 1]),
        }
    }
}

/// DNS-over-TLS resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub listen_addr: String,
    pub upstream: String,
    pub upstream_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:853".to_string(),
            upstream: "1.1.1.1:53".to_string(),
            upstream_timeout_secs: 2,
            handshake_timeout_secs: 10,
            read_timeout_secs: 5,
        }
    }
}

/// TLS transport proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen_addr: String,
    pub peek_bytes: usize,
    pub handshake_timeout_secs: u64,
    pub peek_timeout_secs: u64,
    pub dial_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            peek_bytes: 8192,
            handshake_timeout_secs: 10,
            peek_timeout_secs: 5,
            dial_timeout_secs: 5,
        }
    }
}

/// Administrative HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("zt-gateway"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/zt-gateway"))
}

/// Loads [`GatewayConfig`] from a CLI flag, the `ZTGW_CONFIG` environment
/// variable, or a platform-standard path, then applies env-var overrides.
pub struct GatewayConfigLoader {
    cli_path: Option<PathBuf>,
}

impl GatewayConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with precedence:
    /// 1. CLI `--config` flag
    /// 2. `ZTGW_CONFIG` environment variable
    /// 3. `~/.config/zt-gateway/config.toml`
    /// 4. `/etc/zt-gateway/config.toml` (unix)
    /// 5. Defaults
    pub fn load(&self) -> GatewayConfigResult<GatewayConfig> {
        let config_path = self.find_config_file();

        let config = if let Some(path) = config_path {
            info!("loading configuration from {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("no config file found, using defaults");
            GatewayConfig::default()
        };

        self.validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("ZTGW_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("ZTGW_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("zt-gateway").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/zt-gateway/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn load_from_file(&self, path: &Path) -> GatewayConfigResult<GatewayConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn validate(&self, config: &GatewayConfig) -> GatewayConfigResult<()> {
        if config.proxy.peek_bytes == 0 {
            return Err(GatewayConfigError::Validation(
                "proxy.peek_bytes must be non-zero".to_string(),
            ));
        }
        if config.resolver.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(GatewayConfigError::Validation(format!(
                "resolver.listen_addr is not a valid socket address: {}",
                config.resolver.listen_addr
            )));
        }
        if config.proxy.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(GatewayConfigError::Validation(format!(
                "proxy.listen_addr is not a valid socket address: {}",
                config.proxy.listen_addr
            )));
        }
        Ok(())
    }
}

impl Default for GatewayConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayConfig {
    pub fn certs_dir(&self) -> PathBuf {
        self.gateway.data_dir.join("certs")
    }

    pub fn data_files_dir(&self) -> PathBuf {
        self.gateway.data_dir.join("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_without_a_file() {
        let loader = GatewayConfigLoader::new();
        let config = loader.load().unwrap();
        assert_eq!(config.resolver.listen_addr, "0.0.0.0:853");
        assert_eq!(config.proxy.listen_addr, "0.0.0.0:8443");
    }

    #[test]
    fn loads_from_explicit_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [gateway]
            external_addr = "203.0.113.9"

            [resolver]
            listen_addr = "0.0.0.0:8530"
            "#,
        )
        .unwrap();

        let loader = GatewayConfigLoader::new().with_cli_path(Some(path));
        let config = loader.load().unwrap();
        assert_eq!(config.gateway.external_addr.to_string(), "203.0.113.9");
        assert_eq!(config.resolver.listen_addr, "0.0.0.0:8530");
    }

    #[test]
    fn rejects_invalid_listen_addr() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [resolver]
            listen_addr = "not-an-addr"
            "#,
        )
        .unwrap();

        let loader = GatewayConfigLoader::new().with_cli_path(Some(path));
        assert!(loader.load().is_err());
    }
}
