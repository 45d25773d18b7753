//! Upstream forwarding resolver
//!
//! Forwards queries to the nameservers of one group, in order, under a
//! fixed per-attempt timeout. Used for delegated zones and as the root
//! handler for the primary group.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hickory_server::proto::rr::RecordType;
use tracing::{debug, warn};

use wiremesh_common::dns::{NameServerGroup, NsType};

use super::mux::{QueryHandler, Resolution};

/// Per-attempt timeout for one upstream nameserver.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolver holding one single-nameserver client per usable upstream,
/// tried in configuration order; the first successful answer wins.
pub struct UpstreamResolver {
    upstreams: Vec<(SocketAddr, TokioAsyncResolver)>,
}

impl UpstreamResolver {
    /// Build the resolver for a nameserver group, filtering out
    /// nameservers of unsupported types. Returns `None` when no usable
    /// nameserver remains; the caller drops the group with a warning.
    pub fn from_group(group: &NameServerGroup) -> Option<Self> {
        let mut upstreams = Vec::new();
        for ns in &group.name_servers {
            if ns.ns_type != NsType::Udp {
                warn!(
                    "skipping nameserver {} with type {}, only {} is supported",
                    ns.ip,
                    ns.ns_type,
                    NsType::Udp
                );
                continue;
            }
            let addr = ns.socket_addr();
            upstreams.push((addr, single_server_resolver(addr)));
        }

        if upstreams.is_empty() {
            return None;
        }
        Some(Self { upstreams })
    }

    pub fn upstream_addrs(&self) -> Vec<SocketAddr> {
        self.upstreams.iter().map(|(addr, _)| *addr).collect()
    }
}

fn single_server_resolver(addr: SocketAddr) -> TokioAsyncResolver {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));

    let mut opts = ResolverOpts::default();
    opts.timeout = UPSTREAM_TIMEOUT;
    opts.attempts = 1;

    TokioAsyncResolver::tokio(config, opts)
}

#[async_trait]
impl QueryHandler for UpstreamResolver {
    async fn resolve(&self, name: &str, record_type: RecordType) -> Resolution {
        for (addr, resolver) in &self.upstreams {
            match resolver.lookup(name, record_type).await {
                Ok(lookup) => {
                    return Resolution::Records(lookup.records().to_vec());
                }
                Err(e) => {
                    debug!("upstream {} failed for {} {}: {}", addr, name, record_type, e);
                }
            }
        }
        Resolution::Delegate
    }
}
