//! Per-interface packet capture
//!
//! Keeps a bounded summary of every frame an interface sends or receives and
//! mirrors each record as JSON to the `pcap` log target at trace level.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::frame::{Frame, IpProtocol, MacAddress, Port};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedFrame {
    pub timestep: u64,
    pub direction: CaptureDirection,
    pub src_mac_addr: MacAddress,
    pub dst_mac_addr: MacAddress,
    pub src_ip_address: Ipv4Addr,
    pub dst_ip_address: Ipv4Addr,
    pub protocol: IpProtocol,
    pub src_port: Option<Port>,
    pub dst_port: Option<Port>,
    pub ttl: u8,
    pub payload: &'static str,
}

#[derive(Debug, Clone)]
pub struct PacketCapture {
    hostname: String,
    port_name: String,
    capacity: usize,
    inbound: VecDeque<CapturedFrame>,
    outbound: VecDeque<CapturedFrame>,
}

impl PacketCapture {
    pub fn new(hostname: &str, port_name: &str, capacity: usize) -> Self {
        Self {
            hostname: hostname.to_string(),
            port_name: port_name.to_string(),
            capacity,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn capture_inbound(&mut self, frame: &Frame, timestep: u64) {
        self.capture(frame, timestep, CaptureDirection::Inbound);
    }

    pub fn capture_outbound(&mut self, frame: &Frame, timestep: u64) {
        self.capture(frame, timestep, CaptureDirection::Outbound);
    }

    fn capture(&mut self, frame: &Frame, timestep: u64, direction: CaptureDirection) {
        let record = CapturedFrame {
            timestep,
            direction,
            src_mac_addr: frame.ethernet().src_mac_addr,
            dst_mac_addr: frame.ethernet().dst_mac_addr,
            src_ip_address: frame.ip().src_ip_address,
            dst_ip_address: frame.ip().dst_ip_address,
            protocol: frame.protocol(),
            src_port: frame.src_port(),
            dst_port: frame.dst_port(),
            ttl: frame.ttl(),
            payload: frame.payload().kind(),
        };
        if log::log_enabled!(target: "pcap", log::Level::Trace) {
            if let Ok(line) = serde_json::to_string(&record) {
                log::trace!(target: "pcap", "{}_{} {}", self.hostname, self.port_name, line);
            }
        }

        if self.capacity == 0 {
            return;
        }
        let records = match direction {
            CaptureDirection::Inbound => &mut self.inbound,
            CaptureDirection::Outbound => &mut self.outbound,
        };
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn inbound(&self) -> impl Iterator<Item = &CapturedFrame> {
        self.inbound.iter()
    }

    pub fn outbound(&self) -> impl Iterator<Item = &CapturedFrame> {
        self.outbound.iter()
    }

    pub fn clear(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
    }
}
