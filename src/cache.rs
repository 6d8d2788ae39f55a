//! Time-bounded connection cache.
//!
//! Maps `(source IP, destination IP)` pairs to the set of destination
//! ports observed within the TTL window. The map is sharded (dashmap),
//! so merges for different keys proceed on independent shard locks while
//! merges for the same key are serialized by the entry guard; there is
//! no global lock over the cache.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::packet::Observation;

/// Aggregated connection state for one `(src, dst)` pair.
///
/// Always handed out as a snapshot clone of the cached state at merge
/// time, never as an alias into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnRecord {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ports: BTreeSet<u16>,
}

impl ConnRecord {
    fn from_observation(obs: &Observation) -> Self {
        Self {
            src_ip: obs.src_ip,
            dst_ip: obs.dst_ip,
            ports: BTreeSet::from([obs.dst_port]),
        }
    }
}

/// Sorted comma-separated port list for log lines.
pub fn ports_to_string(ports: &BTreeSet<u16>) -> String {
    let rendered: Vec<String> = ports.iter().map(u16::to_string).collect();
    rendered.join(",")
}

struct CacheSlot {
    record: ConnRecord,
    expires_at: Instant,
}

/// TTL-bound cache of [`ConnRecord`]s keyed by `"src->dst"`.
pub struct ConnCache {
    slots: DashMap<String, CacheSlot>,
    ttl: Duration,
}

impl ConnCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Cache key for a source/destination pair. Order-sensitive: the
    /// source renders first.
    pub fn key(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> String {
        format!("{src_ip}->{dst_ip}")
    }

    /// Merge one observation into the cache and return the post-merge
    /// snapshot.
    ///
    /// A missing or expired entry starts a fresh record holding just the
    /// observed port; a live entry gets the port unioned in and its TTL
    /// refreshed. Expiry is lazy: expired entries are treated as absent
    /// on the next access for their key.
    pub fn get_or_merge(&self, obs: &Observation) -> ConnRecord {
        let now = Instant::now();
        match self.slots.entry(Self::key(obs.src_ip, obs.dst_ip)) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if now >= slot.expires_at {
                    slot.record = ConnRecord::from_observation(obs);
                } else {
                    slot.record.ports.insert(obs.dst_port);
                }
                slot.expires_at = now + self.ttl;
                slot.record.clone()
            }
            Entry::Vacant(vacant) => {
                let slot = vacant.insert(CacheSlot {
                    record: ConnRecord::from_observation(obs),
                    expires_at: now + self.ttl,
                });
                slot.record.clone()
            }
        }
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| now < s.expires_at).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
