use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::protocol::RECV_BUFFER_SIZE;
use crate::utils::{P2PError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub recv_buffer_size: usize,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            recv_buffer_size: RECV_BUFFER_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn log_level(&self) -> Result<LevelFilter> {
        parse_level(&self.log_level)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recv_buffer_size == 0 {
            return Err(P2PError::ConfigError(
                "recv_buffer_size must be non-zero".to_string(),
            ));
        }
        self.log_level()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub registry_host: String,
    pub registry_port: u16,
    /// Must be non-zero; 0 is the registry's "not found" id.
    pub peer_id: u32,
    pub shared_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Local port for both the control connection and the file server.
    /// 0 lets the OS pick.
    pub serve_port: u16,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry_host: "127.0.0.1".to_string(),
            registry_port: 8080,
            peer_id: 1,
            shared_dir: PathBuf::from("./SharedFiles"),
            download_dir: PathBuf::from("."),
            serve_port: 0,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn log_level(&self) -> Result<LevelFilter> {
        parse_level(&self.log_level)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id == 0 {
            return Err(P2PError::ConfigError(
                "peer id 0 is reserved for \"not found\"".to_string(),
            ));
        }
        if self.registry_host.is_empty() {
            return Err(P2PError::ConfigError("registry host is empty".to_string()));
        }
        self.log_level()?;
        Ok(())
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        P2PError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level)
        .map_err(|_| P2PError::ConfigError(format!("unknown log level {:?}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn test_peer_id_zero_rejected() {
        let config = ClientConfig {
            peer_id: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(P2PError::ConfigError(_))));
    }

    #[test]
    fn test_log_level_parsing() {
        let config = ServerConfig {
            log_level: "DEBUG".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.log_level().unwrap(), LevelFilter::Debug);

        let bad = ServerConfig {
            log_level: "chatty".to_string(),
            ..ServerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "peer_id": 7, "registry_port": 9000 }}"#).unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.peer_id, 7);
        assert_eq!(config.registry_port, 9000);
        assert_eq!(config.registry_host, "127.0.0.1");
    }
}
