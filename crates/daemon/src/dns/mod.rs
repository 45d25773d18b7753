//! DNS reconciliation and the listening service
//!
//! [`DnsServer`] owns the domain dispatch table and the local record
//! resolver, and applies versioned DNS snapshots by diffing the target
//! registration and record sets against the active ones. Registrations
//! are mutated incrementally (add, then remove extras) so unaffected
//! zones never see a gap in service.

pub mod local;
pub mod mux;
pub mod upstream;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wiremesh_common::dns::{CustomZone, DnsUpdate, NameServerGroup, SimpleRecord};
use wiremesh_common::{Error, Result, ROOT_ZONE};

use local::LocalResolver;
use mux::{normalize, HandlerTable, QueryHandler, Resolution};
use upstream::UpstreamResolver;

/// Default listen address of the DNS service.
pub const DEFAULT_DNS_LISTEN: &str = "0.0.0.0:5053";

/// Bounded wait for the listener to drain on stop.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One `(pattern, handler)` target registration computed from a snapshot.
struct TableUpdate {
    pattern: String,
    handler: Arc<dyn QueryHandler>,
}

/// State mutated under the reconciler's lock.
struct Inner {
    serial: u64,
    /// Patterns registered by the last applied snapshot.
    registrations: HashSet<String>,
    /// Names of the local records registered by the last applied
    /// snapshot, including ones whose registration failed and was
    /// skipped (the name still participates in the next diff).
    local_records: HashSet<String>,
    listener: Option<ServerFuture<Dispatcher>>,
    bound_addr: Option<SocketAddr>,
    torn_down: bool,
}

/// The DNS reconciler and service.
pub struct DnsServer {
    listen: SocketAddr,
    table: Arc<HandlerTable>,
    local: Arc<LocalResolver>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl DnsServer {
    pub fn new(listen: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            listen,
            table: Arc::new(HandlerTable::new()),
            local: Arc::new(LocalResolver::new()),
            cancel,
            inner: Mutex::new(Inner {
                serial: 0,
                registrations: HashSet::new(),
                local_records: HashSet::new(),
                listener: None,
                bound_addr: None,
                torn_down: false,
            }),
        }
    }

    /// Last successfully applied snapshot serial.
    pub async fn serial(&self) -> u64 {
        self.inner.lock().await.serial
    }

    /// Currently registered dispatch patterns, for diagnostics.
    pub fn registered_domains(&self) -> Vec<String> {
        self.table.patterns()
    }

    /// Address the listener is bound to, when running.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.bound_addr
    }

    /// Apply a versioned DNS snapshot.
    ///
    /// The whole update is rejected, with no mutation, when the serial is
    /// stale or the snapshot is malformed; a single record that fails to
    /// register is logged and skipped.
    pub async fn apply_update(&self, serial: u64, update: &DnsUpdate) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!("not applying dns update, shutdown in progress");
            return Err(Error::ShutdownInProgress);
        }

        let mut inner = self.inner.lock().await;

        if serial < inner.serial {
            return Err(Error::StaleUpdate {
                current: inner.serial,
                received: serial,
            });
        }

        // When the service is disabled the listener stops, but handlers
        // and records are still reconciled below.
        if !update.service_enable {
            stop_listener(&mut inner).await;
        } else if inner.listener.is_none() && !inner.torn_down {
            if let Err(e) = self.start_listener(&mut inner).await {
                error!("failed to start dns listener: {}", e);
            }
        }

        // Build the full target state first; nothing is touched when any
        // part of the snapshot is malformed.
        let (mut table_updates, target_records) =
            build_local_update(&update.custom_zones, self.local.clone())?;
        table_updates.extend(build_upstream_update(&update.name_server_groups)?);

        self.update_table(&mut inner, table_updates);
        self.update_local_records(&mut inner, target_records);

        inner.serial = serial;
        debug!(serial, "dns update applied");
        Ok(())
    }

    /// Register every target pattern (overwriting in place), then drop
    /// the registrations the target no longer contains.
    fn update_table(&self, inner: &mut Inner, updates: Vec<TableUpdate>) {
        let mut next: HashSet<String> = HashSet::new();
        for update in updates {
            self.table.register(&update.pattern, update.handler);
            next.insert(normalize(&update.pattern));
        }

        for pattern in &inner.registrations {
            if !next.contains(pattern) {
                self.table.deregister(pattern);
            }
        }

        inner.registrations = next;
    }

    /// Delete records absent from the target set, then (re)register every
    /// target record. A failed registration is logged and skipped.
    fn update_local_records(&self, inner: &mut Inner, target: HashMap<String, SimpleRecord>) {
        for name in &inner.local_records {
            if !target.contains_key(name) {
                self.local.delete_record(name);
            }
        }

        let mut next: HashSet<String> = HashSet::new();
        for (name, record) in target {
            if let Err(e) = self.local.register_record(&record) {
                warn!("failed to register record {}: {}", record.name, e);
            }
            next.insert(name);
        }

        inner.local_records = next;
    }

    async fn start_listener(&self, inner: &mut Inner) -> Result<()> {
        let socket = UdpSocket::bind(self.listen)
            .await
            .map_err(|e| Error::Dns(format!("failed to bind udp {}: {}", self.listen, e)))?;
        let bound = socket
            .local_addr()
            .map_err(|e| Error::Dns(format!("failed to read bound address: {}", e)))?;

        let mut server = ServerFuture::new(Dispatcher {
            table: self.table.clone(),
        });
        server.register_socket(socket);

        inner.listener = Some(server);
        inner.bound_addr = Some(bound);
        info!("dns listener started on {}", bound);
        Ok(())
    }

    /// Stop the service and make the reconciler terminal: later updates
    /// are rejected and the listener cannot be restarted.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        inner.torn_down = true;
        stop_listener(&mut inner).await;
    }
}

/// Idempotent listener stop with a bounded drain timeout.
async fn stop_listener(inner: &mut Inner) {
    let Some(mut listener) = inner.listener.take() else {
        return;
    };
    inner.bound_addr = None;
    match tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, listener.shutdown_gracefully()).await {
        Ok(Ok(())) => info!("dns listener stopped"),
        Ok(Err(e)) => warn!("dns listener shutdown returned an error: {}", e),
        Err(_) => warn!(
            "dns listener did not stop within {:?}",
            LISTENER_SHUTDOWN_TIMEOUT
        ),
    }
}

fn build_local_update(
    zones: &[CustomZone],
    local: Arc<LocalResolver>,
) -> Result<(Vec<TableUpdate>, HashMap<String, SimpleRecord>)> {
    let mut updates = Vec::new();
    let mut records: HashMap<String, SimpleRecord> = HashMap::new();

    for zone in zones {
        if zone.records.is_empty() {
            return Err(Error::MalformedSnapshot(format!(
                "custom zone {} has an empty list of records",
                zone.domain
            )));
        }

        updates.push(TableUpdate {
            pattern: zone.domain.clone(),
            handler: local.clone(),
        });

        // last writer wins for a duplicate record name
        for record in &zone.records {
            records.insert(normalize(&record.name), record.clone());
        }
    }

    Ok((updates, records))
}

fn build_upstream_update(groups: &[NameServerGroup]) -> Result<Vec<TableUpdate>> {
    let mut updates = Vec::new();

    for group in groups {
        let Some(resolver) = UpstreamResolver::from_group(group) else {
            warn!("dropping nameserver group with no usable nameservers");
            continue;
        };
        let handler: Arc<dyn QueryHandler> = Arc::new(resolver);

        if group.primary {
            updates.push(TableUpdate {
                pattern: ROOT_ZONE.to_string(),
                handler,
            });
            continue;
        }

        if group.domains.is_empty() {
            return Err(Error::MalformedSnapshot(
                "non-primary nameserver group has an empty domain list".into(),
            ));
        }

        for domain in &group.domains {
            if domain.is_empty() {
                return Err(Error::MalformedSnapshot(
                    "nameserver group contains an empty domain".into(),
                ));
            }
            updates.push(TableUpdate {
                pattern: domain.clone(),
                handler: handler.clone(),
            });
        }
    }

    Ok(updates)
}

/// Request handler bridging the listening service to the dispatch table:
/// every inbound query walks the table's match chain until a handler
/// answers, falling back to NXDOMAIN.
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<HandlerTable>,
}

impl Dispatcher {
    pub fn new(table: Arc<HandlerTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler,
    {
        let query = request.query();
        let name = normalize(&query.name().to_string());
        let record_type = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        for handler in self.table.matches(&name) {
            match handler.resolve(&name, record_type).await {
                Resolution::Records(records) => {
                    let builder = MessageResponseBuilder::from_message_request(request);
                    let response = builder.build(
                        header,
                        records.iter(),
                        std::iter::empty(),
                        std::iter::empty(),
                        std::iter::empty(),
                    );
                    return match response_handle.send_response(response).await {
                        Ok(info) => info,
                        Err(e) => {
                            error!("failed to send dns response for {}: {}", name, e);
                            ResponseInfo::from(header)
                        }
                    };
                }
                Resolution::Delegate => continue,
            }
        }

        header.set_response_code(ResponseCode::NXDomain);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build_no_records(header);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("failed to send dns response for {}: {}", name, e);
                ResponseInfo::from(header)
            }
        }
    }
}
