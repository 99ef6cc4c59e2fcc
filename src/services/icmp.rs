//! ICMP echo bookkeeping
//!
//! Echo frames are built and answered by the session layer. This service
//! tracks, per target, how many echoes the last ping sent and how many came
//! back.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::software::SoftwareBehaviour;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PingRecord {
    pub identifier: u32,
    pub sent: u32,
    pub replied: u32,
}

impl PingRecord {
    pub fn all_replied(&self) -> bool {
        self.sent > 0 && self.replied == self.sent
    }
}

#[derive(Debug, Clone, Default)]
pub struct Icmp {
    pings: BTreeMap<Ipv4Addr, PingRecord>,
    next_identifier: u32,
}

impl Icmp {
    /// Begin a fresh ping session towards `target`; returns its identifier
    pub fn start_ping(&mut self, target: Ipv4Addr, count: u32) -> u32 {
        self.next_identifier += 1;
        self.pings.insert(
            target,
            PingRecord {
                identifier: self.next_identifier,
                sent: count,
                replied: 0,
            },
        );
        self.next_identifier
    }

    /// Count an echo reply; stale identifiers are ignored
    pub fn record_reply(&mut self, source: Ipv4Addr, identifier: u32) -> bool {
        match self.pings.get_mut(&source) {
            Some(record) if record.identifier == identifier && record.replied < record.sent => {
                record.replied += 1;
                true
            }
            _ => false,
        }
    }

    pub fn ping_record(&self, target: Ipv4Addr) -> Option<PingRecord> {
        self.pings.get(&target).copied()
    }
}

impl SoftwareBehaviour for Icmp {
    fn describe_state(&self, state: &mut Map<String, Value>) {
        let pings: Map<String, Value> = self
            .pings
            .iter()
            .map(|(ip, record)| (ip.to_string(), serde_json::to_value(record).unwrap_or(Value::Null)))
            .collect();
        state.insert("pings".to_string(), Value::Object(pings));
    }
}
