//! Daemon configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use wiremesh_common::{Error, Result};

use crate::dns::DEFAULT_DNS_LISTEN;
use crate::sshd::SSH_PORT;

/// Daemon configuration, loaded from a TOML file merged over defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path of the control socket the snapshot transport connects to.
    pub control_socket: PathBuf,

    /// This node's tunnel address in CIDR form.
    pub tunnel_address: String,

    /// Listen address of the DNS service.
    pub dns_listen: SocketAddr,

    /// SSH server settings.
    pub ssh: SshdConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/var/run/wiremesh/control.sock"),
            tunnel_address: "100.64.0.1/24".to_string(),
            dns_listen: DEFAULT_DNS_LISTEN.parse().expect("default listen address"),
            ssh: SshdConfig::default(),
        }
    }
}

/// SSH-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshdConfig {
    /// Port the SSH server binds on the tunnel address.
    pub port: u16,

    /// Path to the host key handed to the SSH server backend.
    pub host_key_path: Option<PathBuf>,
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            host_key_path: None,
        }
    }
}

impl DaemonConfig {
    /// Load the configuration file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }
}
