//! Configuration for the sync engine
//!
//! Handles loading and saving the indexing-server settings shared by every
//! consumer of the engine. The endpoint is an explicit value threaded into the
//! connection controller at configure time, never ambient process state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Remote indexing server endpoint. Immutable once applied to a connection;
/// reconfiguring invalidates any live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: Option<u16>,
    /// Whether to wrap the transport in TLS
    pub tls: bool,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: Option<u16>, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Hosts only reachable through an anonymity network get the long
    /// request deadline.
    pub fn is_onion(&self) -> bool {
        self.host.to_ascii_lowercase().ends_with(".onion")
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", scheme, self.host, port),
            None => write!(f, "{}://{}", scheme, self.host),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Indexing server to sync against
    pub endpoint: Option<ServerEndpoint>,

    /// Trust certificate for a self-signed server, if any
    pub certificate_path: Option<PathBuf>,

    /// Whether connections go through a SOCKS proxy
    #[serde(default)]
    pub use_proxy: bool,

    /// Proxy address in "host:port" form
    pub proxy_server: Option<String>,

    /// Operator override for the request deadline, in seconds.
    /// Takes precedence over the computed default when set.
    pub timeout_override_secs: Option<u64>,

    /// Directory where wallet files are stored
    pub wallet_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            certificate_path: None,
            use_proxy: false,
            proxy_server: None,
            timeout_override_secs: None,
            wallet_dir: default_wallet_dir(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!(
                "No config file found, creating default at: {}",
                config_path.display()
            );
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_file_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref endpoint) = self.endpoint {
            if endpoint.host.trim().is_empty() {
                return Err(anyhow::anyhow!("Server host must not be empty"));
            }
        }

        if let Some(ref proxy) = self.proxy_server {
            if !proxy.contains(':') {
                return Err(anyhow::anyhow!(
                    "Proxy must be in format 'host:port', got: {}",
                    proxy
                ));
            }
            let port_str = proxy.rsplit(':').next().unwrap_or_default();
            port_str
                .parse::<u16>()
                .with_context(|| format!("Invalid port in proxy: {}", proxy))?;
        }

        if self.timeout_override_secs == Some(0) {
            return Err(anyhow::anyhow!("Timeout override must be greater than zero"));
        }

        if !self.wallet_dir.exists() {
            fs::create_dir_all(&self.wallet_dir).with_context(|| {
                format!("Cannot create wallet directory: {}", self.wallet_dir.display())
            })?;
        }

        Ok(())
    }
}

/// Get the default wallet directory
fn default_wallet_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "siskin")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".siskin")
        })
}

/// Get the configuration file path
fn config_file_path() -> PathBuf {
    let config_dir = directories::ProjectDirs::from("", "", "siskin")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("siskin")
        });

    config_dir.join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let plain = ServerEndpoint::new("electrum.example.org", Some(50001), false);
        assert_eq!(plain.to_string(), "tcp://electrum.example.org:50001");

        let tls = ServerEndpoint::new("electrum.example.org", None, true);
        assert_eq!(tls.to_string(), "ssl://electrum.example.org");
    }

    #[test]
    fn test_onion_detection() {
        let onion = ServerEndpoint::new("explorerzydxu5ecjrkwceayqybizmpjjznk5izmitf2modhcusuqlid.ONION", Some(110), false);
        assert!(onion.is_onion());

        let clearnet = ServerEndpoint::new("electrum.example.org", Some(50002), true);
        assert!(!clearnet.is_onion());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            endpoint: Some(ServerEndpoint::new("localhost", Some(50001), false)),
            certificate_path: None,
            use_proxy: true,
            proxy_server: Some("127.0.0.1:9050".to_string()),
            timeout_override_secs: Some(45),
            wallet_dir: PathBuf::from("/tmp/wallets"),
        };

        let toml = toml::to_string(&config).unwrap();
        assert!(toml.contains("host = \"localhost\""));
        assert!(toml.contains("use_proxy = true"));

        let deserialized: Config = toml::from_str(&toml).unwrap();
        assert_eq!(deserialized.endpoint, config.endpoint);
        assert_eq!(deserialized.timeout_override_secs, Some(45));
    }

    #[test]
    fn test_validation() {
        let mut config = Config {
            wallet_dir: std::env::temp_dir().join("siskin-test-wallets"),
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.endpoint = Some(ServerEndpoint::new("  ", None, false));
        assert!(config.validate().is_err());

        config.endpoint = Some(ServerEndpoint::new("localhost", Some(50001), false));
        config.proxy_server = Some("localhost".to_string());
        assert!(config.validate().is_err());

        config.proxy_server = Some("localhost:9050".to_string());
        assert!(config.validate().is_ok());

        config.timeout_override_secs = Some(0);
        assert!(config.validate().is_err());
    }
}
