//! DNS snapshot types
//!
//! The DNS portion of a network-map snapshot: custom zones served from
//! locally registered records plus nameserver groups for delegated and
//! default upstream resolution.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// The reserved root pattern. A registration under this pattern answers
/// every domain not claimed by a more specific one.
pub const ROOT_ZONE: &str = ".";

/// Default port for upstream nameservers.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Versioned DNS configuration carried in a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsUpdate {
    /// Whether the local listening service should run at all. Disabling
    /// stops the listener but still reconciles handlers and records.
    #[serde(default)]
    pub service_enable: bool,
    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,
    #[serde(default)]
    pub name_server_groups: Vec<NameServerGroup>,
}

/// A zone answered from locally registered records.
///
/// A custom zone with zero records is a malformed input and rejects the
/// whole update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomZone {
    pub domain: String,
    #[serde(default)]
    pub records: Vec<SimpleRecord>,
}

/// One locally served record. `rdata` is parsed according to
/// `record_type` at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRecord {
    pub name: String,
    pub record_type: RecordKind,
    #[serde(default)]
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: String,
}

/// Record types servable from the local resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Txt,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::A => write!(f, "A"),
            RecordKind::Aaaa => write!(f, "AAAA"),
            RecordKind::Cname => write!(f, "CNAME"),
            RecordKind::Txt => write!(f, "TXT"),
        }
    }
}

/// Record class. Only IN is in use on the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordClass {
    #[default]
    In,
}

/// A group of upstream nameservers.
///
/// A primary group becomes the root handler for every unmatched domain; a
/// non-primary group must name the domains it serves. A non-primary group
/// with zero domains is malformed, while a group whose nameservers are all
/// unusable is dropped with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServerGroup {
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub name_servers: Vec<NameServer>,
}

/// One upstream nameserver endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub ip: IpAddr,
    #[serde(default)]
    pub ns_type: NsType,
    #[serde(default = "default_ns_port")]
    pub port: u16,
}

fn default_ns_port() -> u16 {
    DEFAULT_DNS_PORT
}

impl NameServer {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

/// Transport type of an upstream nameserver. Only UDP is supported by
/// this client; other types are skipped at configuration-build time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsType {
    #[default]
    Udp,
    Tcp,
}

impl std::fmt::Display for NsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NsType::Udp => write!(f, "udp"),
            NsType::Tcp => write!(f, "tcp"),
        }
    }
}
