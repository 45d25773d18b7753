//! Network-map snapshot types
//!
//! A [`NetworkMap`] is a complete, versioned description of the desired
//! network state for this node, produced by the coordination service and
//! delivered whole. It is never merged field-by-field; the only partial-ness
//! is the explicit `remote_peers_is_empty` flag distinguishing "no peer
//! update" from "the desired peer set is empty".

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::dns::DnsUpdate;

/// Versioned snapshot of the desired network state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    /// Monotonically-intended version number. Snapshots with a serial
    /// below the last applied one are rejected.
    pub serial: u64,

    /// This node's own address and SSH settings.
    #[serde(default)]
    pub peer_config: Option<PeerSelfConfig>,

    /// Desired remote peer set, keyed by public key.
    #[serde(default)]
    pub remote_peers: Vec<RemotePeerConfig>,

    /// True when the desired peer set is intentionally empty, as opposed
    /// to the field simply being absent from this update.
    #[serde(default)]
    pub remote_peers_is_empty: bool,

    /// Routes to forward to the route manager.
    #[serde(default)]
    pub routes: Vec<Route>,

    /// DNS configuration carried inside the network map, applied by the
    /// DNS reconciler under the same serial.
    #[serde(default)]
    pub dns: Option<DnsUpdate>,
}

/// This node's configuration as seen by the coordination service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerSelfConfig {
    /// Tunnel address in CIDR form, e.g. `100.64.0.1/24`.
    pub address: String,
    #[serde(default)]
    pub ssh: SshConfig,
}

/// SSH settings embedded in the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    /// Whether this node should run an SSH server for the mesh.
    #[serde(default)]
    pub enabled: bool,
}

/// Desired configuration for one remote peer.
///
/// Identity (and the equality used for diffing) is the public key; a peer
/// reappearing with different allowed IPs is the same peer with a changed
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerConfig {
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// SSH public key of the peer, if it participates in mesh SSH.
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

impl RemotePeerConfig {
    /// Allowed IPs in the canonical comma-joined form used for change
    /// detection and for the proxy configuration.
    pub fn allowed_ips_joined(&self) -> String {
        self.allowed_ips.join(",")
    }
}

/// A route descriptor, forwarded opaquely to the route manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub network: IpNetwork,
    pub net_id: String,
    /// Public key of the routing peer.
    pub peer: String,
    #[serde(default)]
    pub masquerade: bool,
    #[serde(default)]
    pub metric: u32,
}

/// Effective state of one active peer connection, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub allowed_ips: String,
    pub ssh_authorized: bool,
}
