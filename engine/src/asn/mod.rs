//! Autonomous-system cache: longest-prefix IP lookup over the netblocks
//! learned during one enumeration, with a fixed reserved-range table
//! consulted first and incremental merging of partial records.

pub mod reserved;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;

use crate::requests::{AsnRequest, Tag};

/// Source attributed to synthetic and cache-derived records.
const CACHE_SOURCE: &str = "RIR";

/// One merged autonomous-system record.
#[derive(Debug, Clone)]
pub struct AsnRecord {
    pub asn: u32,
    pub cc: String,
    pub registry: String,
    pub allocation_date: Option<DateTime<Utc>>,
    pub description: String,
    pub netblocks: Vec<IpNetwork>,
}

struct CacheInner {
    records: HashMap<u32, AsnRecord>,
    /// (prefix, asn) in insertion order; earliest insertion wins when two
    /// systems claim the same prefix, keeping lookups deterministic.
    prefixes: Vec<(IpNetwork, u32)>,
    table: IpNetworkTable<u32>,
    /// Set when `prefixes` grew past what `table` was built from.
    stale: bool,
}

impl CacheInner {
    fn rebuild(&mut self) {
        let mut table = IpNetworkTable::new();
        for (network, asn) in &self.prefixes {
            if table.exact_match(*network).is_none() {
                table.insert(*network, *asn);
            }
        }
        self.table = table;
        self.stale = false;
    }
}

/// Singleton-per-enumeration ASN cache. Interior locking makes it safe to
/// share across pipeline workers.
pub struct AsnCache {
    inner: RwLock<CacheInner>,
}

impl Default for AsnCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AsnCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                records: HashMap::new(),
                prefixes: Vec::new(),
                table: IpNetworkTable::new(),
                stale: false,
            }),
        }
    }

    /// Merge-or-insert an ASN record.
    ///
    /// Missing optional fields on an existing entry are filled in from the
    /// request; the description is overwritten only by a strictly longer
    /// one; the netblock set is unioned with the request prefix and
    /// netblocks. New prefixes invalidate the lookup table lazily.
    pub fn update(&self, req: &AsnRequest) {
        // ASN 0 is reserved for synthesised fallback entries, which carry
        // a prefix by construction; anything else with ASN 0 is noise.
        if req.asn == 0 && req.prefix.is_none() {
            return;
        }
        // An address claimed to sit inside a prefix that does not contain
        // it marks the whole record inconsistent.
        if let (Some(addr), Some(prefix)) = (req.address, req.prefix) {
            if !prefix.contains(addr) {
                return;
            }
        }

        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let record = inner.records.entry(req.asn).or_insert_with(|| AsnRecord {
            asn: req.asn,
            cc: String::new(),
            registry: String::new(),
            allocation_date: None,
            description: String::new(),
            netblocks: Vec::new(),
        });

        if record.cc.is_empty() && !req.cc.is_empty() {
            record.cc = req.cc.clone();
        }
        if record.registry.is_empty() && !req.registry.is_empty() {
            record.registry = req.registry.clone();
        }
        if record.allocation_date.is_none() {
            record.allocation_date = req.allocation_date;
        }
        if req.description.len() > record.description.len() {
            record.description = req.description.clone();
        }

        let mut added = Vec::new();
        for network in req.prefix.iter().chain(req.netblocks.iter()) {
            if !record.netblocks.contains(network) {
                record.netblocks.push(*network);
                added.push(*network);
            }
        }
        if !added.is_empty() {
            for network in added {
                inner.prefixes.push((network, req.asn));
            }
            inner.stale = true;
        }
    }

    /// Locate the record owning `addr`, given as text. Parse failure is
    /// reported the same way as an unknown system: no entry.
    pub fn addr_search(&self, addr: &str) -> Option<AsnRequest> {
        let addr: IpAddr = addr.parse().ok()?;
        self.ip_search(addr)
    }

    /// Locate the record owning `addr`.
    ///
    /// Reserved ranges yield a synthetic entry with ASN 0. Otherwise the
    /// smallest known netblock containing the address decides, and the
    /// returned record carries that netblock as its prefix together with
    /// the owner's full netblock set.
    pub fn ip_search(&self, addr: IpAddr) -> Option<AsnRequest> {
        if let Some(network) = reserved::find(addr) {
            return Some(AsnRequest {
                address: Some(addr),
                asn: 0,
                prefix: Some(network),
                description: reserved::RESERVED_DESCRIPTION.to_string(),
                netblocks: vec![network],
                tag: Tag::Rir,
                source: CACHE_SOURCE.to_string(),
                ..Default::default()
            });
        }

        {
            let inner = self.inner.read().unwrap();
            if !inner.stale {
                return lookup(&inner, addr);
            }
        }
        let mut inner = self.inner.write().unwrap();
        if inner.stale {
            inner.rebuild();
        }
        lookup(&inner, addr)
    }

    /// All records whose description contains `substring` (case-sensitive).
    pub fn description_search(&self, substring: &str) -> Vec<AsnRequest> {
        let inner = self.inner.read().unwrap();
        let mut found: Vec<AsnRequest> = inner
            .records
            .values()
            .filter(|record| record.description.contains(substring))
            .map(|record| to_request(record, None, None))
            .collect();
        found.sort_by_key(|req| req.asn);
        found
    }
}

fn lookup(inner: &CacheInner, addr: IpAddr) -> Option<AsnRequest> {
    let (network, asn) = inner.table.longest_match(addr)?;
    let record = inner.records.get(asn)?;
    Some(to_request(record, Some(addr), Some(network)))
}

fn to_request(record: &AsnRecord, addr: Option<IpAddr>, prefix: Option<IpNetwork>) -> AsnRequest {
    AsnRequest {
        address: addr,
        asn: record.asn,
        prefix,
        cc: record.cc.clone(),
        registry: record.registry.clone(),
        allocation_date: record.allocation_date,
        description: record.description.clone(),
        netblocks: record.netblocks.clone(),
        tag: Tag::Rir,
        source: CACHE_SOURCE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_of(asn: u32, prefix: &str) -> AsnRequest {
        AsnRequest {
            asn,
            prefix: Some(prefix.parse().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn merge_fills_missing_fields_and_unions_netblocks() {
        let cache = AsnCache::new();
        cache.update(&update_of(26808, "72.237.4.0/24"));
        cache.update(&AsnRequest {
            asn: 26808,
            cc: "US".to_string(),
            netblocks: vec![
                "72.237.4.0/24".parse().unwrap(),
                "8.24.68.0/23".parse().unwrap(),
            ],
            ..Default::default()
        });

        let found = cache.addr_search("8.24.68.1").unwrap();
        assert_eq!(found.asn, 26808);
        assert_eq!(found.prefix.unwrap().to_string(), "8.24.68.0/23");
        assert_eq!(found.cc, "US");
        assert_eq!(found.netblocks.len(), 2);
    }

    #[test]
    fn update_is_idempotent() {
        let cache = AsnCache::new();
        let req = AsnRequest {
            asn: 15169,
            cc: "US".to_string(),
            description: "GOOGLE".to_string(),
            prefix: Some("172.217.0.0/19".parse().unwrap()),
            ..Default::default()
        };
        cache.update(&req);
        let first = cache.addr_search("172.217.0.1").unwrap();
        cache.update(&req);
        let second = cache.addr_search("172.217.0.1").unwrap();

        assert_eq!(first.asn, second.asn);
        assert_eq!(first.description, second.description);
        assert_eq!(first.netblocks.len(), second.netblocks.len());
    }

    #[test]
    fn smallest_netblock_wins() {
        let cache = AsnCache::new();
        cache.update(&update_of(100, "8.0.0.0/8"));
        cache.update(&update_of(200, "8.24.68.0/23"));

        let found = cache.ip_search("8.24.68.9".parse().unwrap()).unwrap();
        assert_eq!(found.asn, 200);
        assert_eq!(found.prefix.unwrap().to_string(), "8.24.68.0/23");

        let outer = cache.ip_search("8.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(outer.asn, 100);
    }

    #[test]
    fn duplicate_prefix_keeps_the_earliest_owner() {
        let cache = AsnCache::new();
        cache.update(&update_of(100, "198.100.0.0/16"));
        cache.update(&update_of(200, "198.100.0.0/16"));

        let found = cache.ip_search("198.100.4.2".parse().unwrap()).unwrap();
        assert_eq!(found.asn, 100);
    }

    #[test]
    fn reserved_space_returns_the_synthetic_entry() {
        let cache = AsnCache::new();
        let found = cache.addr_search("192.0.2.1").unwrap();
        assert_eq!(found.asn, 0);
        assert_eq!(found.prefix.unwrap().to_string(), "192.0.2.0/24");
        assert_eq!(found.description, reserved::RESERVED_DESCRIPTION);
    }

    #[test]
    fn unparseable_addresses_yield_no_entry() {
        let cache = AsnCache::new();
        assert!(cache.addr_search("not.a.valid.addr").is_none());
    }

    #[test]
    fn description_is_only_replaced_by_longer_text() {
        let cache = AsnCache::new();
        cache.update(&AsnRequest {
            asn: 16509,
            description: "AMAZON-02 - Amazon.com Inc.".to_string(),
            prefix: Some("52.8.0.0/13".parse().unwrap()),
            ..Default::default()
        });
        cache.update(&AsnRequest {
            asn: 16509,
            description: "AMAZON".to_string(),
            prefix: Some("52.8.0.0/13".parse().unwrap()),
            ..Default::default()
        });

        let found = cache.description_search("Amazon.com");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].asn, 16509);
    }
}
