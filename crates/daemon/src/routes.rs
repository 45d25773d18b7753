//! Route-programming interface

use async_trait::async_trait;
use wiremesh_common::{Result, Route};

/// Interface to the subsystem that programs routes into the host.
///
/// The engine forwards the route list of every applied snapshot, keyed by
/// the snapshot serial. Errors from the implementation are logged by the
/// engine and never fail the surrounding reconciliation.
#[async_trait]
pub trait RouteManager: Send + Sync {
    async fn update_routes(&self, serial: u64, routes: Vec<Route>) -> Result<()>;
}
