//! Logging stand-ins for the data-plane collaborators
//!
//! The daemon wires these when no tunnel backend is available, so the
//! reconcilers run end-to-end against the control channel and every
//! intended data-plane action is visible in the logs.
//! TODO: replace with the WireGuard connector once the tunnel backend
//! lands.

use async_trait::async_trait;
use tracing::debug;

use wiremesh_common::{Result, Route};

use crate::peer::Connector;
use crate::routes::RouteManager;

/// Connector that records intended session changes in the log.
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    async fn create(&self, public_key: &str, allowed_ips: &str) -> Result<()> {
        debug!("would open session to {} for {}", public_key, allowed_ips);
        Ok(())
    }

    async fn update_config(&self, public_key: &str, allowed_ips: &str) -> Result<()> {
        debug!("would reconfigure session to {} for {}", public_key, allowed_ips);
        Ok(())
    }

    async fn close(&self, public_key: &str) -> Result<()> {
        debug!("would close session to {}", public_key);
        Ok(())
    }
}

/// Route manager that records intended route changes in the log.
pub struct NullRouteManager;

#[async_trait]
impl RouteManager for NullRouteManager {
    async fn update_routes(&self, serial: u64, routes: Vec<Route>) -> Result<()> {
        debug!("would program {} routes for serial {}", routes.len(), serial);
        Ok(())
    }
}
