//! Local record resolver
//!
//! Answers queries from an explicitly registered set of records. A miss
//! delegates back to the dispatch table; this resolver never forwards
//! upstream on its own.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use hickory_server::proto::rr::rdata::{A, AAAA, CNAME, TXT};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;

use wiremesh_common::dns::{RecordKind, SimpleRecord};
use wiremesh_common::{Error, Result};

use super::mux::{normalize, QueryHandler, Resolution};

/// Resolver backed by the records of all custom zones, keyed by record
/// name. One record per name; the snapshot builder already applied the
/// last-writer-wins rule for duplicates.
#[derive(Default)]
pub struct LocalResolver {
    records: RwLock<HashMap<String, Record>>,
}

impl LocalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register one record, replacing any record previously
    /// held under the same name.
    pub fn register_record(&self, record: &SimpleRecord) -> Result<()> {
        let built = build_record(record)?;
        self.records.write().insert(normalize(&record.name), built);
        Ok(())
    }

    /// Drop the record registered under `name`, if any.
    pub fn delete_record(&self, name: &str) {
        self.records.write().remove(&normalize(name));
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl QueryHandler for LocalResolver {
    async fn resolve(&self, name: &str, record_type: RecordType) -> Resolution {
        let records = self.records.read();
        match records.get(name) {
            Some(record)
                if record_type == record.record_type()
                    || record_type == RecordType::ANY
                    || record.record_type() == RecordType::CNAME =>
            {
                Resolution::Records(vec![record.clone()])
            }
            // registered name, but not under the queried type: answer
            // authoritatively with no records instead of delegating
            Some(_) => Resolution::Records(Vec::new()),
            None => Resolution::Delegate,
        }
    }
}

fn build_record(record: &SimpleRecord) -> Result<Record> {
    let name = Name::from_utf8(normalize(&record.name))
        .map_err(|e| Error::Dns(format!("invalid record name {:?}: {}", record.name, e)))?;

    let rdata = match record.record_type {
        RecordKind::A => {
            let ip: Ipv4Addr = record.rdata.parse().map_err(|e| {
                Error::Dns(format!("invalid A rdata {:?}: {}", record.rdata, e))
            })?;
            RData::A(A(ip))
        }
        RecordKind::Aaaa => {
            let ip: Ipv6Addr = record.rdata.parse().map_err(|e| {
                Error::Dns(format!("invalid AAAA rdata {:?}: {}", record.rdata, e))
            })?;
            RData::AAAA(AAAA(ip))
        }
        RecordKind::Cname => {
            let target = Name::from_utf8(&record.rdata).map_err(|e| {
                Error::Dns(format!("invalid CNAME rdata {:?}: {}", record.rdata, e))
            })?;
            RData::CNAME(CNAME(target))
        }
        RecordKind::Txt => RData::TXT(TXT::new(vec![record.rdata.clone()])),
    };

    Ok(Record::from_rdata(name, record.ttl, rdata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremesh_common::dns::RecordClass;

    fn a_record(name: &str, ip: &str) -> SimpleRecord {
        SimpleRecord {
            name: name.into(),
            record_type: RecordKind::A,
            class: RecordClass::In,
            ttl: 300,
            rdata: ip.into(),
        }
    }

    #[tokio::test]
    async fn test_registered_record_is_answered() {
        let resolver = LocalResolver::new();
        resolver
            .register_record(&a_record("db.corp.internal", "10.0.0.5"))
            .unwrap();

        match resolver.resolve("db.corp.internal", RecordType::A).await {
            Resolution::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].data(), Some(&RData::A(A("10.0.0.5".parse().unwrap()))));
                assert_eq!(records[0].ttl(), 300);
            }
            Resolution::Delegate => panic!("expected an answer"),
        }
    }

    #[tokio::test]
    async fn test_miss_delegates_without_forwarding() {
        let resolver = LocalResolver::new();
        resolver
            .register_record(&a_record("db.corp.internal", "10.0.0.5"))
            .unwrap();

        assert!(matches!(
            resolver.resolve("other.corp.internal", RecordType::A).await,
            Resolution::Delegate
        ));
    }

    #[tokio::test]
    async fn test_type_mismatch_answers_empty() {
        let resolver = LocalResolver::new();
        resolver
            .register_record(&a_record("db.corp.internal", "10.0.0.5"))
            .unwrap();

        match resolver.resolve("db.corp.internal", RecordType::AAAA).await {
            Resolution::Records(records) => assert!(records.is_empty()),
            Resolution::Delegate => panic!("registered names never delegate"),
        }
    }

    #[test]
    fn test_invalid_rdata_is_rejected() {
        let resolver = LocalResolver::new();
        let err = resolver
            .register_record(&a_record("db.corp.internal", "not-an-ip"))
            .unwrap_err();
        assert!(err.to_string().contains("invalid A rdata"));
        assert_eq!(resolver.record_count(), 0);
    }

    #[test]
    fn test_reregistration_replaces() {
        let resolver = LocalResolver::new();
        resolver
            .register_record(&a_record("db.corp.internal", "10.0.0.5"))
            .unwrap();
        resolver
            .register_record(&a_record("DB.corp.internal.", "10.0.0.6"))
            .unwrap();
        assert_eq!(resolver.record_count(), 1);
    }

    #[test]
    fn test_delete_record() {
        let resolver = LocalResolver::new();
        resolver
            .register_record(&a_record("db.corp.internal", "10.0.0.5"))
            .unwrap();
        resolver.delete_record("db.corp.internal");
        assert_eq!(resolver.record_count(), 0);
    }
}
