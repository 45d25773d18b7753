//! Peer/network-map reconciliation engine
//!
//! Applies versioned network-map snapshots: diffs the desired peer set
//! against the live connection map, forwards routes, and drives the SSH
//! server and its authorized-key set. Snapshots whose serial is behind
//! the last applied one are rejected without touching any state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wiremesh_common::{Error, NetworkMap, PeerStatus, RemotePeerConfig, Result};

use crate::peer::{Connector, PeerConn};
use crate::routes::RouteManager;
use crate::sshd::{SshServer, SshServerFactory, SSH_PORT};

/// Bounded wait for per-connection teardown during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Engine configuration supplied by the daemon.
pub struct EngineConfig {
    /// Host key handed to the SSH server factory.
    pub ssh_host_key: Vec<u8>,
    /// Port the SSH server binds on the tunnel address.
    pub ssh_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ssh_host_key: Vec::new(),
            ssh_port: SSH_PORT,
        }
    }
}

/// The network-map reconciler.
///
/// Owns the map of active peer connections keyed by peer public key.
/// `apply_network_map` takes `&mut self`: callers are expected to invoke
/// it sequentially from a single control-channel consumer.
pub struct Engine {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    route_manager: Arc<dyn RouteManager>,
    ssh_factory: SshServerFactory,
    ssh_server: Option<Box<dyn SshServer>>,
    peers: HashMap<String, PeerConn>,
    serial: u64,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        route_manager: Arc<dyn RouteManager>,
        ssh_factory: SshServerFactory,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            route_manager,
            ssh_factory,
            ssh_server: None,
            peers: HashMap::new(),
            serial: 0,
            cancel,
        }
    }

    /// Last successfully applied snapshot serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Effective configuration of every active peer connection.
    pub fn peers(&self) -> Vec<PeerStatus> {
        let ssh_running = self.ssh_server.is_some();
        self.peers
            .values()
            .map(|conn| PeerStatus {
                public_key: conn.public_key().to_string(),
                allowed_ips: conn.allowed_ips().to_string(),
                ssh_authorized: ssh_running && conn.ssh_public_key().is_some(),
            })
            .collect()
    }

    #[cfg(test)]
    fn peer(&self, key: &str) -> Option<&PeerConn> {
        self.peers.get(key)
    }

    /// Apply a network-map snapshot.
    ///
    /// Route-manager failures and single-peer failures are logged and do
    /// not fail the call; only stale, malformed and post-shutdown updates
    /// are reported back to the transport.
    pub async fn apply_network_map(&mut self, map: &NetworkMap) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!("not applying network map, shutdown in progress");
            return Err(Error::ShutdownInProgress);
        }

        if map.serial < self.serial {
            return Err(Error::StaleUpdate {
                current: self.serial,
                received: map.serial,
            });
        }

        debug!(serial = map.serial, peers = map.remote_peers.len(), "applying network map");

        // Route failures are isolated from peer reconciliation.
        if let Err(e) = self
            .route_manager
            .update_routes(map.serial, map.routes.clone())
            .await
        {
            warn!("failed to update routes for serial {}: {}", map.serial, e);
        }

        self.reconcile_ssh_server(map).await;

        // An empty peer list only means "empty desired set" when the
        // snapshot says so explicitly; otherwise the field was absent
        // from this update and the active set is left alone.
        if !map.remote_peers.is_empty() || map.remote_peers_is_empty {
            let desired = dedup_last_wins(&map.remote_peers);
            self.reconcile_peers(&desired).await;
        }

        self.serial = map.serial;
        Ok(())
    }

    async fn reconcile_peers(&mut self, desired: &[RemotePeerConfig]) {
        let removed: Vec<String> = self
            .peers
            .keys()
            .filter(|key| !desired.iter().any(|p| &p.public_key == *key))
            .cloned()
            .collect();
        for key in removed {
            self.remove_peer(&key).await;
        }

        for peer in desired {
            match self.peers.get(&peer.public_key) {
                Some(conn) if conn.needs_update(peer) => {
                    if let Err(e) = self
                        .connector
                        .update_config(&peer.public_key, &peer.allowed_ips_joined())
                        .await
                    {
                        warn!("failed to update peer {}: {}", peer.public_key, e);
                        continue;
                    }
                    if let Some(conn) = self.peers.get_mut(&peer.public_key) {
                        conn.apply(peer);
                    }
                }
                Some(_) => {}
                None => {
                    // One failed creation must not abort the rest of the
                    // snapshot.
                    match self
                        .connector
                        .create(&peer.public_key, &peer.allowed_ips_joined())
                        .await
                    {
                        Ok(()) => {
                            info!("created connection to peer {}", peer.public_key);
                            self.peers
                                .insert(peer.public_key.clone(), PeerConn::new(peer));
                        }
                        Err(e) => {
                            warn!("failed to create connection to peer {}: {}", peer.public_key, e);
                            continue;
                        }
                    }
                }
            }

            if let (Some(server), Some(ssh_key)) =
                (self.ssh_server.as_mut(), peer.ssh_public_key.as_deref())
            {
                if let Err(e) = server.add_authorized_key(&peer.public_key, ssh_key) {
                    warn!("failed to authorize ssh key of peer {}: {}", peer.public_key, e);
                }
            }
        }
    }

    async fn remove_peer(&mut self, key: &str) {
        if self.peers.remove(key).is_none() {
            return;
        }
        if let Some(server) = self.ssh_server.as_mut() {
            server.remove_authorized_key(key);
        }
        if let Err(e) = self.connector.close(key).await {
            warn!("failed to close connection to peer {}: {}", key, e);
        } else {
            info!("removed connection to peer {}", key);
        }
    }

    /// Start or stop the SSH server according to the snapshot. When the
    /// server is already in the desired state only the authorized-key set
    /// is reconciled by the caller; the server is never restarted here.
    async fn reconcile_ssh_server(&mut self, map: &NetworkMap) {
        let enabled = map
            .peer_config
            .as_ref()
            .map(|c| c.ssh.enabled)
            .unwrap_or(false);

        if enabled {
            if self.ssh_server.is_some() {
                return;
            }
            let address = map
                .peer_config
                .as_ref()
                .map(|c| c.address.as_str())
                .unwrap_or_default();
            let bind = match ssh_bind_addr(address, self.config.ssh_port) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("not starting ssh server: {}", e);
                    return;
                }
            };
            match (self.ssh_factory)(&self.config.ssh_host_key, bind) {
                Ok(server) => {
                    info!("ssh server started on {}", bind);
                    self.ssh_server = Some(server);
                }
                Err(e) => {
                    warn!("failed to start ssh server on {}: {}", bind, e);
                }
            }
        } else if let Some(mut server) = self.ssh_server.take() {
            if let Err(e) = server.stop().await {
                warn!("failed to stop ssh server: {}", e);
            } else {
                info!("ssh server stopped");
            }
        }
    }

    /// Tear everything down: every connection and the SSH server, each
    /// under a bounded grace period. Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();

        let keys: Vec<String> = self.peers.drain().map(|(key, _)| key).collect();
        for key in keys {
            match tokio::time::timeout(SHUTDOWN_GRACE, self.connector.close(&key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to close connection to peer {}: {}", key, e),
                Err(_) => warn!("timed out closing connection to peer {}", key),
            }
        }

        if let Some(mut server) = self.ssh_server.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, server.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to stop ssh server: {}", e),
                Err(_) => warn!("timed out stopping ssh server"),
            }
        }
    }
}

/// Deduplicate descriptors by public key, keeping snapshot order; the
/// last occurrence of a key wins for connection configuration.
fn dedup_last_wins(peers: &[RemotePeerConfig]) -> Vec<RemotePeerConfig> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<RemotePeerConfig> = Vec::new();
    for peer in peers {
        match index.get(peer.public_key.as_str()) {
            Some(&i) => out[i] = peer.clone(),
            None => {
                index.insert(&peer.public_key, out.len());
                out.push(peer.clone());
            }
        }
    }
    out
}

/// Derive the SSH bind address from the node's tunnel address in CIDR
/// form, e.g. `100.64.0.1/24` -> `100.64.0.1:<port>`.
fn ssh_bind_addr(address: &str, port: u16) -> Result<SocketAddr> {
    let network: IpNetwork = address
        .parse()
        .map_err(|e| Error::Ssh(format!("invalid tunnel address {:?}: {}", address, e)))?;
    Ok(SocketAddr::new(network.ip(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use wiremesh_common::{PeerSelfConfig, Route, SshConfig};

    #[derive(Default)]
    struct MockConnector {
        created: Mutex<Vec<(String, String)>>,
        updated: Mutex<Vec<(String, String)>>,
        closed: Mutex<Vec<String>>,
        fail_create: Mutex<HashSet<String>>,
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn create(&self, public_key: &str, allowed_ips: &str) -> Result<()> {
            if self.fail_create.lock().contains(public_key) {
                return Err(Error::Connection {
                    peer: public_key.into(),
                    reason: "refused".into(),
                });
            }
            self.created
                .lock()
                .push((public_key.into(), allowed_ips.into()));
            Ok(())
        }

        async fn update_config(&self, public_key: &str, allowed_ips: &str) -> Result<()> {
            self.updated
                .lock()
                .push((public_key.into(), allowed_ips.into()));
            Ok(())
        }

        async fn close(&self, public_key: &str) -> Result<()> {
            self.closed.lock().push(public_key.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockRouteManager {
        calls: Mutex<Vec<(u64, usize)>>,
        fail: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl RouteManager for MockRouteManager {
        async fn update_routes(&self, serial: u64, routes: Vec<Route>) -> Result<()> {
            self.calls.lock().push((serial, routes.len()));
            if *self.fail.lock() {
                return Err(Error::Dns("mocked route failure".into()));
            }
            Ok(())
        }
    }

    struct MockSshServer {
        added: Arc<Mutex<Vec<(String, String)>>>,
        removed: Arc<Mutex<Vec<String>>>,
        stopped: Arc<Mutex<bool>>,
    }

    #[async_trait::async_trait]
    impl SshServer for MockSshServer {
        fn add_authorized_key(&mut self, peer: &str, ssh_key: &str) -> Result<()> {
            self.added.lock().push((peer.into(), ssh_key.into()));
            Ok(())
        }

        fn remove_authorized_key(&mut self, peer: &str) {
            self.removed.lock().push(peer.into());
        }

        async fn stop(&mut self) -> Result<()> {
            *self.stopped.lock() = true;
            Ok(())
        }
    }

    struct SshProbe {
        added: Arc<Mutex<Vec<(String, String)>>>,
        removed: Arc<Mutex<Vec<String>>>,
        stopped: Arc<Mutex<bool>>,
        starts: Arc<Mutex<u32>>,
    }

    fn ssh_probe_factory() -> (SshServerFactory, SshProbe) {
        let probe = SshProbe {
            added: Arc::new(Mutex::new(Vec::new())),
            removed: Arc::new(Mutex::new(Vec::new())),
            stopped: Arc::new(Mutex::new(false)),
            starts: Arc::new(Mutex::new(0)),
        };
        let added = probe.added.clone();
        let removed = probe.removed.clone();
        let stopped = probe.stopped.clone();
        let starts = probe.starts.clone();
        let factory: SshServerFactory = Box::new(move |_key, _addr| {
            *starts.lock() += 1;
            Ok(Box::new(MockSshServer {
                added: added.clone(),
                removed: removed.clone(),
                stopped: stopped.clone(),
            }))
        });
        (factory, probe)
    }

    fn engine_with(
        connector: Arc<MockConnector>,
        routes: Arc<MockRouteManager>,
        factory: SshServerFactory,
    ) -> Engine {
        Engine::new(
            EngineConfig::default(),
            connector,
            routes,
            factory,
            CancellationToken::new(),
        )
    }

    fn peer(key: &str, ip: &str) -> RemotePeerConfig {
        RemotePeerConfig {
            public_key: key.into(),
            allowed_ips: vec![ip.into()],
            ssh_public_key: None,
        }
    }

    fn map_with_peers(serial: u64, peers: Vec<RemotePeerConfig>) -> NetworkMap {
        NetworkMap {
            serial,
            remote_peers: peers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_network_map_serial_cases() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector.clone(), routes, factory);

        let p1 = peer("K1", "100.64.0.10/24");
        let p2 = peer("K2", "100.64.0.11/24");
        let p3 = peer("K3", "100.64.0.12/24");
        let p3_modified = peer("K3", "100.64.0.20/24");

        // new peer to add
        engine
            .apply_network_map(&map_with_peers(1, vec![p1.clone()]))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.serial(), 1);

        // an old peer and a new peer
        engine
            .apply_network_map(&map_with_peers(2, vec![p1.clone(), p2.clone()]))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 2);
        assert_eq!(engine.serial(), 2);

        // outdated update is ignored entirely
        let err = engine
            .apply_network_map(&map_with_peers(0, vec![p1.clone(), p2.clone(), p3.clone()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleUpdate { current: 2, received: 0 }));
        assert_eq!(engine.peer_count(), 2);
        assert_eq!(engine.serial(), 2);

        // one peer removed, one added
        engine
            .apply_network_map(&map_with_peers(4, vec![p2.clone(), p3.clone()]))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 2);
        assert!(engine.peer("K1").is_none());
        assert_eq!(connector.closed.lock().as_slice(), ["K1".to_string()]);

        // equal serial, one peer modified in place
        engine
            .apply_network_map(&map_with_peers(4, vec![p3_modified.clone(), p2.clone()]))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 2);
        assert_eq!(engine.serial(), 4);
        assert_eq!(engine.peer("K3").unwrap().allowed_ips(), "100.64.0.20/24");
        assert_eq!(
            connector.updated.lock().as_slice(),
            [("K3".to_string(), "100.64.0.20/24".to_string())]
        );

        // explicit empty set removes everything
        let mut empty = map_with_peers(5, vec![]);
        empty.remote_peers_is_empty = true;
        engine.apply_network_map(&empty).await.unwrap();
        assert_eq!(engine.peer_count(), 0);
        assert_eq!(engine.serial(), 5);
    }

    #[tokio::test]
    async fn test_absent_peer_field_leaves_set_alone() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector, routes, factory);

        engine
            .apply_network_map(&map_with_peers(1, vec![peer("K1", "100.64.0.10/24")]))
            .await
            .unwrap();

        // empty list without the explicit-empty flag: no peer update
        engine.apply_network_map(&map_with_peers(2, vec![])).await.unwrap();
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.serial(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_key_last_occurrence_wins() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector, routes, factory);

        let map = map_with_peers(
            1,
            vec![peer("K1", "100.64.0.10/24"), peer("K1", "100.64.0.99/24")],
        );
        engine.apply_network_map(&map).await.unwrap();
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.peer("K1").unwrap().allowed_ips(), "100.64.0.99/24");
    }

    #[tokio::test]
    async fn test_route_manager_failure_is_isolated() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        *routes.fail.lock() = true;
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector, routes.clone(), factory);

        let mut map = map_with_peers(1, vec![peer("K1", "100.64.0.10/24")]);
        map.routes = vec![Route {
            id: "a".into(),
            network: "192.168.0.0/24".parse().unwrap(),
            net_id: "n1".into(),
            peer: "p1".into(),
            masquerade: false,
            metric: 9999,
        }];

        engine.apply_network_map(&map).await.unwrap();
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.serial(), 1);
        assert_eq!(routes.calls.lock().as_slice(), [(1, 1)]);
    }

    #[tokio::test]
    async fn test_one_failed_creation_does_not_abort_snapshot() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_create.lock().insert("K1".into());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector.clone(), routes, factory);

        engine
            .apply_network_map(&map_with_peers(
                1,
                vec![peer("K1", "100.64.0.10/24"), peer("K2", "100.64.0.11/24")],
            ))
            .await
            .unwrap();
        assert_eq!(engine.peer_count(), 1);
        assert!(engine.peer("K2").is_some());
        assert_eq!(engine.serial(), 1);
    }

    fn ssh_map(serial: u64, enabled: bool, peers: Vec<RemotePeerConfig>) -> NetworkMap {
        NetworkMap {
            serial,
            peer_config: Some(PeerSelfConfig {
                address: "100.64.0.1/24".into(),
                ssh: SshConfig { enabled },
            }),
            remote_peers: peers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ssh_lifecycle_and_authorization() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, probe) = ssh_probe_factory();
        let mut engine = engine_with(connector, routes, factory);

        let mut p3 = peer("K3", "100.64.0.21/24");
        p3.ssh_public_key = Some("ssh-ed25519 AAAA-K3".into());

        // server disabled: remote ssh keys are ignored
        engine
            .apply_network_map(&map_with_peers(6, vec![p3.clone()]))
            .await
            .unwrap();
        assert_eq!(*probe.starts.lock(), 0);
        assert!(probe.added.lock().is_empty());

        // enabling ssh starts the server and authorizes the peer key
        engine
            .apply_network_map(&ssh_map(7, true, vec![p3.clone()]))
            .await
            .unwrap();
        assert_eq!(*probe.starts.lock(), 1);
        assert_eq!(
            probe.added.lock().as_slice(),
            [("K3".to_string(), "ssh-ed25519 AAAA-K3".to_string())]
        );

        // removing the peer revokes its authorization, server keeps running
        let mut removal = ssh_map(8, true, vec![]);
        removal.remote_peers_is_empty = true;
        engine.apply_network_map(&removal).await.unwrap();
        assert_eq!(probe.removed.lock().as_slice(), ["K3".to_string()]);
        assert_eq!(*probe.starts.lock(), 1);
        assert!(!*probe.stopped.lock());

        // disabling stops the server without restarting it later
        engine
            .apply_network_map(&ssh_map(9, false, vec![p3.clone()]))
            .await
            .unwrap();
        assert!(*probe.stopped.lock());
    }

    #[tokio::test]
    async fn test_apply_rejected_after_cancellation() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let cancel = CancellationToken::new();
        let mut engine = Engine::new(
            EngineConfig::default(),
            connector,
            routes,
            factory,
            cancel.clone(),
        );

        cancel.cancel();
        let err = engine
            .apply_network_map(&map_with_peers(1, vec![peer("K1", "100.64.0.10/24")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShutdownInProgress));
        assert_eq!(engine.serial(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_connections() {
        let connector = Arc::new(MockConnector::default());
        let routes = Arc::new(MockRouteManager::default());
        let (factory, _probe) = ssh_probe_factory();
        let mut engine = engine_with(connector.clone(), routes, factory);

        engine
            .apply_network_map(&map_with_peers(
                1,
                vec![peer("K1", "100.64.0.10/24"), peer("K2", "100.64.0.11/24")],
            ))
            .await
            .unwrap();

        engine.shutdown().await;
        assert_eq!(engine.peer_count(), 0);
        let mut closed = connector.closed.lock().clone();
        closed.sort();
        assert_eq!(closed, ["K1".to_string(), "K2".to_string()]);
    }
}
