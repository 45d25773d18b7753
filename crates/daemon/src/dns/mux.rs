//! Domain dispatch table
//!
//! Maps domain patterns to query handlers. A query is offered to the
//! handler of the longest matching suffix first; a handler may delegate,
//! in which case the next shorter match (and finally the root
//! registration, if present) is tried. The table is owned by its
//! reconciler instance and torn down with it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::proto::rr::{Record, RecordType};
use parking_lot::RwLock;

use wiremesh_common::ROOT_ZONE;

/// Outcome of offering a query to one handler.
#[derive(Debug)]
pub enum Resolution {
    /// Authoritative answer, possibly empty.
    Records(Vec<Record>),
    /// This handler has nothing to say; try the next match.
    Delegate,
}

/// A resolver capable of answering queries for a registered pattern.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// `name` is the queried name, lowercase and without the trailing dot.
    async fn resolve(&self, name: &str, record_type: RecordType) -> Resolution;
}

/// Normalize a domain pattern or query name: lowercase, no trailing dot.
/// The root pattern is preserved as-is.
pub fn normalize(name: &str) -> String {
    if name == ROOT_ZONE {
        return name.to_string();
    }
    name.trim_end_matches('.').to_lowercase()
}

/// Instance-owned registration table.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, replacing any existing
    /// registration for that pattern.
    pub fn register(&self, pattern: &str, handler: Arc<dyn QueryHandler>) {
        self.handlers.write().insert(normalize(pattern), handler);
    }

    /// Remove the registration for `pattern`, if any.
    pub fn deregister(&self, pattern: &str) {
        self.handlers.write().remove(&normalize(pattern));
    }

    /// Currently registered patterns, for diagnostics.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.handlers.read().keys().cloned().collect();
        patterns.sort();
        patterns
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Handlers matching `name`, most specific suffix first, ending with
    /// the root registration when one exists.
    pub fn matches(&self, name: &str) -> Vec<Arc<dyn QueryHandler>> {
        let name = normalize(name);
        let handlers = self.handlers.read();
        let mut chain = Vec::new();

        let mut suffix = name.as_str();
        loop {
            if let Some(handler) = handlers.get(suffix) {
                chain.push(handler.clone());
            }
            match suffix.find('.') {
                Some(dot) => suffix = &suffix[dot + 1..],
                None => break,
            }
        }

        if let Some(root) = handlers.get(ROOT_ZONE) {
            chain.push(root.clone());
        }
        chain
    }
}
