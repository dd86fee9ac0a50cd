//! Callsign-to-address cache (`spec.md` §4.5), grounded on
//! `original_source/Common/CacheManager.h`/`.cpp`: a single map keyed
//! by the padded 8-byte callsign, storing the reflector/repeater
//! protocol, its resolved address and port, and whether the entry came
//! from a locked (operator-maintained) source that must never be
//! overwritten by an unlocked (internet-downloaded) one.

pub mod hosts;

pub use hosts::HostsFilesManager;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use crate::callsign::Callsign;
use crate::config::ReflectorProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayRecord {
    pub protocol: ReflectorProtocol,
    pub address: SocketAddr,
    pub locked: bool,
}

/// Externally synchronized via an inner `RwLock`; `spec.md` §5 has the
/// hosts-file refresh thread and the routing thread both touching this
/// concurrently, so the lock lives inside rather than being imposed by
/// callers.
#[derive(Default)]
pub struct GatewayCache {
    records: RwLock<HashMap<Callsign, GatewayRecord>>,
}

impl GatewayCache {
    pub fn new() -> GatewayCache {
        GatewayCache {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn find(&self, callsign: &Callsign) -> Option<GatewayRecord> {
        self.records.read().expect("cache lock poisoned").get(callsign).copied()
    }

    /// Inserts or replaces a record, honoring locked-entry precedence:
    /// a `locked` entry already present is never overwritten by an
    /// unlocked one, but a locked insert always wins.
    pub fn insert(&self, callsign: Callsign, record: GatewayRecord) {
        let mut map = self.records.write().expect("cache lock poisoned");
        match map.get(&callsign) {
            Some(existing) if existing.locked && !record.locked => {}
            _ => {
                map.insert(callsign, record);
            }
        }
    }

    pub fn remove(&self, callsign: &Callsign) {
        self.records.write().expect("cache lock poisoned").remove(callsign);
    }

    /// Drops every unlocked record, e.g. ahead of a fresh internet
    /// hosts-file load so stale entries do not linger.
    pub fn clear_unlocked(&self) {
        self.records.write().expect("cache lock poisoned").retain(|_, r| r.locked);
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
