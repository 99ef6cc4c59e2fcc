//! Layer-2 switching
//!
//! Learns which port each source MAC address lives behind and forwards by
//! destination MAC. Broadcast and unknown destinations are flooded to every
//! other enabled port. IP headers are never inspected.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{Node, NodeKind};
use crate::frame::{Frame, MacAddress};

#[derive(Debug, Clone, Default)]
pub struct SwitchState {
    mac_address_table: BTreeMap<MacAddress, usize>,
}

impl SwitchState {
    pub fn port_for(&self, mac_address: &MacAddress) -> Option<usize> {
        self.mac_address_table.get(mac_address).copied()
    }

    pub fn num_entries(&self) -> usize {
        self.mac_address_table.len()
    }

    /// Returns true when the entry is new or the host moved ports
    fn learn(&mut self, mac_address: MacAddress, port_num: usize) -> bool {
        self.mac_address_table.insert(mac_address, port_num) != Some(port_num)
    }

    pub(crate) fn describe_state(&self) -> Value {
        let table: Map<String, Value> = self
            .mac_address_table
            .iter()
            .map(|(mac_address, port_num)| (mac_address.to_string(), Value::from(*port_num)))
            .collect();
        Value::Object(table)
    }
}

impl Node {
    pub(crate) fn switch_frame(&mut self, port_num: usize, frame: Frame) {
        let NodeKind::Switch(state) = &mut self.kind else {
            return;
        };
        let ethernet = *frame.ethernet();
        if state.learn(ethernet.src_mac_addr, port_num) {
            self.context
                .sys_log
                .debug(format!("Learned {} on port {}", ethernet.src_mac_addr, port_num));
        }

        let known = if ethernet.dst_mac_addr.is_broadcast() {
            None
        } else {
            state.port_for(&ethernet.dst_mac_addr)
        };
        match known {
            Some(egress) if egress == port_num => {}
            Some(egress) => self.switch_out(egress, frame),
            None => {
                let flood: Vec<usize> = self
                    .network_interfaces
                    .values()
                    .filter(|interface| interface.port_num != port_num && interface.is_enabled())
                    .map(|interface| interface.port_num)
                    .collect();
                for egress in flood {
                    self.switch_out(egress, frame.clone());
                }
            }
        }
    }

    /// Switch ports forward the frame untouched
    fn switch_out(&mut self, port_num: usize, frame: Frame) {
        let timestep = self.context.timestep;
        if let Some(interface) = self.network_interfaces.get_mut(&port_num) {
            if let Some(frame) = interface.send_frame(frame, timestep) {
                self.outbox.push((port_num, frame));
            }
        }
    }
}
