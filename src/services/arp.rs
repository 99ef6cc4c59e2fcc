//! ARP cache
//!
//! The request/reply exchange itself runs in the node's session layer; this
//! service only owns the IP-to-MAC table it fills.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::frame::MacAddress;
use crate::software::SoftwareBehaviour;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArpEntry {
    pub mac_address: MacAddress,
    /// Local port the address was learned on
    pub port_num: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Arp {
    cache: BTreeMap<Ipv4Addr, ArpEntry>,
}

impl Arp {
    pub fn add_arp_cache_entry(&mut self, ip_address: Ipv4Addr, mac_address: MacAddress, port_num: usize) {
        self.cache.insert(ip_address, ArpEntry { mac_address, port_num });
    }

    pub fn get_arp_cache_entry(&self, ip_address: Ipv4Addr) -> Option<ArpEntry> {
        self.cache.get(&ip_address).copied()
    }

    pub fn get_arp_cache_mac_address(&self, ip_address: Ipv4Addr) -> Option<MacAddress> {
        self.cache.get(&ip_address).map(|entry| entry.mac_address)
    }

    pub fn remove_arp_cache_entry(&mut self, ip_address: Ipv4Addr) -> bool {
        self.cache.remove(&ip_address).is_some()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl SoftwareBehaviour for Arp {
    fn describe_state(&self, state: &mut Map<String, Value>) {
        let cache: Map<String, Value> = self
            .cache
            .iter()
            .map(|(ip, entry)| {
                let entry = serde_json::to_value(entry).unwrap_or(Value::Null);
                (ip.to_string(), entry)
            })
            .collect();
        state.insert("arp_cache".to_string(), Value::Object(cache));
    }
}
