//! SSH server interface
//!
//! The engine decides when the server runs and which peer keys are
//! authorized; the server implementation itself is provided through a
//! factory at construction time and owns its own listener task.

use std::net::SocketAddr;

use async_trait::async_trait;
use wiremesh_common::{Error, Result};

/// Port the mesh SSH server binds on the tunnel address.
pub const SSH_PORT: u16 = 44338;

/// A running SSH server instance.
#[async_trait]
pub trait SshServer: Send + Sync {
    /// Authorize `ssh_key` for the peer identified by `peer`.
    fn add_authorized_key(&mut self, peer: &str, ssh_key: &str) -> Result<()>;

    /// Revoke every key previously authorized for `peer`.
    fn remove_authorized_key(&mut self, peer: &str);

    /// Stop the listener and drop all authorizations.
    async fn stop(&mut self) -> Result<()>;
}

/// Builds an [`SshServer`] from the host key and the bind address derived
/// from this node's tunnel address.
pub type SshServerFactory =
    Box<dyn Fn(&[u8], SocketAddr) -> Result<Box<dyn SshServer>> + Send + Sync>;

/// Factory used when no SSH backend is compiled in: starting the server
/// fails with a descriptive error, which the engine logs and tolerates.
pub fn disabled_factory() -> SshServerFactory {
    Box::new(|_host_key, addr| {
        Err(Error::Ssh(format!(
            "no ssh server backend configured, cannot listen on {}",
            addr
        )))
    })
}
