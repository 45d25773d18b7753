//! Peer connections and the connection-establishment interface

use async_trait::async_trait;
use wiremesh_common::{RemotePeerConfig, Result};

/// Interface to the subsystem that establishes and supervises encrypted
/// sessions to remote peers. Implementations own their internal
/// concurrency; the engine only tracks the map of live connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to the peer identified by `public_key`.
    async fn create(&self, public_key: &str, allowed_ips: &str) -> Result<()>;

    /// Apply a changed configuration to an existing session.
    async fn update_config(&self, public_key: &str, allowed_ips: &str) -> Result<()>;

    /// Tear down the session to the peer.
    async fn close(&self, public_key: &str) -> Result<()>;
}

/// Bookkeeping for one active peer connection, owned exclusively by the
/// engine. Created on first appearance of a public key in a snapshot and
/// destroyed when the key disappears or on shutdown.
#[derive(Debug, Clone)]
pub struct PeerConn {
    public_key: String,
    allowed_ips: String,
    ssh_public_key: Option<String>,
}

impl PeerConn {
    pub fn new(desired: &RemotePeerConfig) -> Self {
        Self {
            public_key: desired.public_key.clone(),
            allowed_ips: desired.allowed_ips_joined(),
            ssh_public_key: desired.ssh_public_key.clone(),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn allowed_ips(&self) -> &str {
        &self.allowed_ips
    }

    pub fn ssh_public_key(&self) -> Option<&str> {
        self.ssh_public_key.as_deref()
    }

    /// Whether the descriptor carries a different configuration than the
    /// one currently applied to this connection.
    pub fn needs_update(&self, desired: &RemotePeerConfig) -> bool {
        self.allowed_ips != desired.allowed_ips_joined()
            || self.ssh_public_key != desired.ssh_public_key
    }

    /// Record the new configuration after the connector accepted it.
    pub fn apply(&mut self, desired: &RemotePeerConfig) {
        self.allowed_ips = desired.allowed_ips_joined();
        self.ssh_public_key = desired.ssh_public_key.clone();
    }
}
