//! Configuration file for the porthole client.
//!
//! Optional `porthole.yml` with the relay URL, auth token, and local port.
//! Command-line flags and environment variables override whatever the file
//! provides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `https://tunnel.example.com`
    pub server: Option<String>,

    /// Authentication token presented on connect
    pub token: Option<String>,

    /// Local port to forward traffic to
    pub local_port: Option<u16>,

    /// Preferred subdomain label
    pub subdomain: Option<String>,
}

impl ClientConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(port) = self.local_port {
            if port == 0 {
                anyhow::bail!("Invalid local port 0");
            }
        }
        if let Some(server) = &self.server {
            if server.is_empty() {
                anyhow::bail!("Relay URL cannot be empty");
            }
        }
        Ok(())
    }

    /// Search for a config file in the working directory, then home.
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["porthole.yml", "porthole.yaml", ".porthole.yml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server: https://tunnel.example.com
token: "test-token"
local_port: 3000
subdomain: myapp
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.as_deref(), Some("https://tunnel.example.com"));
        assert_eq!(config.token.as_deref(), Some("test-token"));
        assert_eq!(config.local_port, Some(3000));
        assert_eq!(config.subdomain.as_deref(), Some("myapp"));
    }

    #[test]
    fn test_partial_config_defaults() {
        let config: ClientConfig = serde_yaml::from_str("token: abc\n").unwrap();
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert!(config.server.is_none());
        assert!(config.local_port.is_none());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config: ClientConfig = serde_yaml::from_str("local_port: 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
