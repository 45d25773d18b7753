//! Wiremesh Common Library
//!
//! Shared snapshot types and the error taxonomy for the wiremesh client.

pub mod dns;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use dns::{CustomZone, DnsUpdate, NameServer, NameServerGroup, SimpleRecord, ROOT_ZONE};
pub use error::{Error, Result};
pub use types::{NetworkMap, PeerSelfConfig, PeerStatus, RemotePeerConfig, Route, SshConfig};

/// Wiremesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
