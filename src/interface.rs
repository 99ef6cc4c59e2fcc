//! Network interfaces
//!
//! Every port on a node is a [`NetworkInterface`]. The kind decides how it
//! treats inbound frames: layer-3 kinds (host NICs, router interfaces, access
//! points) spend one hop of TTL and filter on destination MAC, switch ports
//! pass everything through untouched.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{NmneConfig, SimConfig};
use crate::error::RequestError;
use crate::frame::{Frame, MacAddress};
use crate::packet_capture::PacketCapture;
use crate::request::{RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken, RequestType};
use crate::sys_log::SysLog;

// ============================================================================
// WIRELESS FREQUENCIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum AirSpaceFrequency {
    #[default]
    #[serde(rename = "WIFI_2_4")]
    Wifi2_4,
    #[serde(rename = "WIFI_5")]
    Wifi5,
}

impl AirSpaceFrequency {
    /// Shared capacity of the band in Mbit per timestep
    pub fn maximum_data_rate_mbps(self) -> f64 {
        match self {
            AirSpaceFrequency::Wifi2_4 => 100.0,
            AirSpaceFrequency::Wifi5 => 500.0,
        }
    }
}

impl fmt::Display for AirSpaceFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AirSpaceFrequency::Wifi2_4 => write!(f, "WIFI_2_4"),
            AirSpaceFrequency::Wifi5 => write!(f, "WIFI_5"),
        }
    }
}

// ============================================================================
// INTERFACE KINDS AND IP SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceKind {
    /// Host network card
    Nic,
    WirelessNic,
    SwitchPort,
    RouterInterface,
    WirelessAccessPoint,
}

impl InterfaceKind {
    pub fn is_layer3(self) -> bool {
        !matches!(self, InterfaceKind::SwitchPort)
    }

    pub fn is_wireless(self) -> bool {
        matches!(self, InterfaceKind::WirelessNic | InterfaceKind::WirelessAccessPoint)
    }

    /// Only host cards count malicious network events
    fn captures_nmne(self) -> bool {
        matches!(self, InterfaceKind::Nic | InterfaceKind::WirelessNic)
    }

    fn port_prefix(self) -> &'static str {
        match self {
            InterfaceKind::Nic => "eth",
            InterfaceKind::WirelessNic | InterfaceKind::WirelessAccessPoint => "wlan",
            InterfaceKind::SwitchPort => "port",
            InterfaceKind::RouterInterface => "ge",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::Nic => write!(f, "NIC"),
            InterfaceKind::WirelessNic => write!(f, "WirelessNIC"),
            InterfaceKind::SwitchPort => write!(f, "SwitchPort"),
            InterfaceKind::RouterInterface => write!(f, "RouterInterface"),
            InterfaceKind::WirelessAccessPoint => write!(f, "WirelessAccessPoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpConfig {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl IpConfig {
    pub fn new(ip_address: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Self {
            ip_address,
            subnet_mask,
        }
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip_address) & u32::from(self.subnet_mask))
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.subnet_mask).count_ones()
    }

    /// True if `address` sits on this interface's subnet
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & u32::from(self.subnet_mask) == u32::from(self.network_address())
    }
}

impl fmt::Display for IpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip_address, self.prefix_len())
    }
}

// ============================================================================
// NETWORK INTERFACE
// ============================================================================

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub port_num: usize,
    pub port_name: String,
    pub kind: InterfaceKind,
    pub mac_address: MacAddress,
    ip_config: Option<IpConfig>,
    frequency: Option<AirSpaceFrequency>,
    enabled: bool,
    pcap: PacketCapture,
    nmne_config: NmneConfig,
    /// Keyword hits since the last observation
    nmne_inbound: u64,
    nmne_outbound: u64,
    request_manager: RequestManager<NetworkInterface, SysLog>,
}

impl NetworkInterface {
    pub fn new(hostname: &str, port_num: usize, kind: InterfaceKind, config: &SimConfig) -> Self {
        let port_name = format!("{}-{}", kind.port_prefix(), port_num);
        Self {
            pcap: PacketCapture::new(hostname, &port_name, config.logging.pcap_capacity),
            port_num,
            port_name,
            kind,
            mac_address: MacAddress::derived(hostname, port_num),
            ip_config: None,
            frequency: kind.is_wireless().then(AirSpaceFrequency::default),
            enabled: true,
            nmne_config: config.nmne.clone(),
            nmne_inbound: 0,
            nmne_outbound: 0,
            request_manager: interface_request_manager(),
        }
    }

    pub fn with_ip(mut self, ip_address: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        self.ip_config = Some(IpConfig::new(ip_address, subnet_mask));
        self
    }

    pub fn ip_config(&self) -> Option<IpConfig> {
        self.ip_config
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.ip_config.map(|ip_config| ip_config.ip_address)
    }

    pub fn set_ip_config(&mut self, ip_config: Option<IpConfig>) {
        self.ip_config = ip_config;
    }

    pub fn frequency(&self) -> Option<AirSpaceFrequency> {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: AirSpaceFrequency) {
        if self.kind.is_wireless() {
            self.frequency = Some(frequency);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pcap(&self) -> &PacketCapture {
        &self.pcap
    }

    pub fn nmne_inbound(&self) -> u64 {
        self.nmne_inbound
    }

    pub fn nmne_outbound(&self) -> u64 {
        self.nmne_outbound
    }

    pub fn enable(&mut self, sys_log: &mut SysLog) -> bool {
        if self.enabled {
            return false;
        }
        self.enabled = true;
        sys_log.info(format!("Network interface {} enabled", self.port_name));
        true
    }

    pub fn disable(&mut self, sys_log: &mut SysLog) -> bool {
        if !self.enabled {
            return false;
        }
        self.enabled = false;
        sys_log.info(format!("Network interface {} disabled", self.port_name));
        true
    }

    fn count_nmne(&mut self, frame: &Frame, inbound: bool) {
        if !self.nmne_config.capture_nmne || !self.kind.captures_nmne() {
            return;
        }
        let payload = frame.payload();
        if self
            .nmne_config
            .nmne_capture_keywords
            .iter()
            .any(|keyword| payload.contains_keyword(keyword))
        {
            if inbound {
                self.nmne_inbound += 1;
            } else {
                self.nmne_outbound += 1;
            }
        }
    }

    /// Entry point for a frame arriving from a link or the airspace.
    ///
    /// Returns the frame if it should be handed to the owning node.
    pub fn receive_frame(&mut self, mut frame: Frame, timestep: u64, sys_log: &mut SysLog) -> Option<Frame> {
        if !self.enabled {
            return None;
        }
        if self.kind.is_layer3() {
            frame.decrement_ttl();
            if !frame.can_transmit() {
                sys_log.warning("Frame discarded as TTL limit reached");
                return None;
            }
        }
        frame.set_received_timestamp(timestep);
        self.pcap.capture_inbound(&frame, timestep);
        self.count_nmne(&frame, true);

        if self.kind == InterfaceKind::SwitchPort {
            return Some(frame);
        }
        let dst_mac_addr = frame.ethernet().dst_mac_addr;
        if dst_mac_addr == self.mac_address || dst_mac_addr.is_broadcast() {
            Some(frame)
        } else {
            None
        }
    }

    /// Stamp and capture a frame leaving this interface; `None` if disabled.
    pub fn send_frame(&mut self, mut frame: Frame, timestep: u64) -> Option<Frame> {
        if !self.enabled {
            return None;
        }
        frame.set_sent_timestamp(timestep);
        self.pcap.capture_outbound(&frame, timestep);
        self.count_nmne(&frame, false);
        Some(frame)
    }

    pub fn pre_timestep(&mut self, _timestep: u64) {
        self.nmne_inbound = 0;
        self.nmne_outbound = 0;
    }

    pub fn describe_state(&self) -> Value {
        let mut directions = serde_json::Map::new();
        if self.nmne_inbound > 0 {
            directions.insert("inbound".to_string(), json!({"keywords": {"*": self.nmne_inbound}}));
        }
        if self.nmne_outbound > 0 {
            directions.insert("outbound".to_string(), json!({"keywords": {"*": self.nmne_outbound}}));
        }
        let nmne = if directions.is_empty() {
            json!({})
        } else {
            json!({ "direction": directions })
        };
        json!({
            "port_num": self.port_num,
            "port_name": self.port_name,
            "type": self.kind,
            "mac_address": self.mac_address,
            "ip_address": self.ip_config.map(|ip_config| ip_config.ip_address.to_string()),
            "subnet_mask": self.ip_config.map(|ip_config| ip_config.subnet_mask.to_string()),
            "frequency": self.frequency,
            "enabled": self.enabled,
            "nmne": nmne,
        })
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip_config {
            Some(ip_config) => write!(f, "Port {}: {}/{}", self.port_name, self.mac_address, ip_config),
            None => write!(f, "Port {}: {}", self.port_name, self.mac_address),
        }
    }
}

impl RequestHandler<SysLog> for NetworkInterface {
    fn request_manager(&self) -> &RequestManager<Self, SysLog> {
        &self.request_manager
    }
}

fn interface_request_manager() -> RequestManager<NetworkInterface, SysLog> {
    fn enable(interface: &mut NetworkInterface, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(interface.enable(sys_log)))
    }
    fn disable(interface: &mut NetworkInterface, sys_log: &mut SysLog, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(interface.disable(sys_log)))
    }

    RequestManager::new()
        .with("enable", RequestType::new(enable))
        .with("disable", RequestType::new(disable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, IpProtocol, POSTGRES_PORT};
    use crate::protocols::{DatabasePacket, Payload};

    fn frame_to(dst_mac_addr: MacAddress, ttl: u8, query: &str) -> Frame {
        FrameBuilder::new(
            MacAddress::derived("client_1", 1),
            dst_mac_addr,
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(192, 168, 1, 14),
            IpProtocol::Tcp,
            ttl,
        )
        .tcp(POSTGRES_PORT, POSTGRES_PORT)
        .payload(Payload::Database(DatabasePacket::Sql {
            query: query.to_string(),
            query_id: 1,
            connection_id: 1,
        }))
        .build()
        .expect("valid frame")
    }

    fn nic() -> (NetworkInterface, SysLog) {
        let interface = NetworkInterface::new("database_server", 1, InterfaceKind::Nic, &SimConfig::default())
            .with_ip(Ipv4Addr::new(192, 168, 1, 14), Ipv4Addr::new(255, 255, 255, 0));
        (interface, SysLog::new("database_server", 50))
    }

    #[test]
    fn test_layer3_receive_spends_ttl_and_drops_at_zero() {
        let (mut interface, mut sys_log) = nic();
        let mac = interface.mac_address;

        let received = interface.receive_frame(frame_to(mac, 5, "SELECT"), 3, &mut sys_log).expect("delivered");
        assert_eq!(received.ttl(), 4);
        assert_eq!(received.received_timestamp(), Some(3));

        assert!(interface.receive_frame(frame_to(mac, 1, "SELECT"), 3, &mut sys_log).is_none());
        assert!(sys_log.contains("TTL limit reached"));
    }

    #[test]
    fn test_switch_port_keeps_ttl_and_ignores_mac() {
        let mut port = NetworkInterface::new("switch_1", 2, InterfaceKind::SwitchPort, &SimConfig::default());
        let mut sys_log = SysLog::new("switch_1", 10);
        let frame = frame_to(MacAddress::derived("elsewhere", 1), 5, "SELECT");
        let received = port.receive_frame(frame, 0, &mut sys_log).expect("passed through");
        assert_eq!(received.ttl(), 5);
    }

    #[test]
    fn test_disabled_interface_neither_sends_nor_receives() {
        let (mut interface, mut sys_log) = nic();
        let mac = interface.mac_address;
        assert!(interface.disable(&mut sys_log));
        assert!(!interface.disable(&mut sys_log));
        assert!(interface.receive_frame(frame_to(mac, 5, "SELECT"), 0, &mut sys_log).is_none());
        assert!(interface.send_frame(frame_to(mac, 5, "SELECT"), 0).is_none());
        assert!(interface.enable(&mut sys_log));
        assert!(interface.send_frame(frame_to(mac, 5, "SELECT"), 0).is_some());
    }

    #[test]
    fn test_frames_for_other_hosts_are_filtered() {
        let (mut interface, mut sys_log) = nic();
        let other = MacAddress::derived("web_server", 1);
        assert!(interface.receive_frame(frame_to(other, 5, "SELECT"), 0, &mut sys_log).is_none());
        assert!(interface
            .receive_frame(frame_to(MacAddress::BROADCAST, 5, "SELECT"), 0, &mut sys_log)
            .is_some());
    }

    #[test]
    fn test_nmne_counts_keyword_hits_until_next_step() {
        let (mut interface, mut sys_log) = nic();
        let mac = interface.mac_address;
        interface.receive_frame(frame_to(mac, 5, "DELETE"), 1, &mut sys_log);
        interface.receive_frame(frame_to(mac, 5, "SELECT"), 1, &mut sys_log);
        interface.send_frame(frame_to(mac, 5, "ENCRYPT"), 1);

        let state = interface.describe_state();
        assert_eq!(state["nmne"]["direction"]["inbound"]["keywords"]["*"], json!(1));
        assert_eq!(state["nmne"]["direction"]["outbound"]["keywords"]["*"], json!(1));

        interface.pre_timestep(2);
        assert_eq!(interface.nmne_inbound(), 0);
        assert_eq!(interface.describe_state()["nmne"], json!({}));
    }

    #[test]
    fn test_ip_config_subnet_membership() {
        let ip_config = IpConfig::new(Ipv4Addr::new(192, 168, 10, 21), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(ip_config.network_address(), Ipv4Addr::new(192, 168, 10, 0));
        assert_eq!(ip_config.prefix_len(), 24);
        assert!(ip_config.contains(Ipv4Addr::new(192, 168, 10, 1)));
        assert!(!ip_config.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(ip_config.to_string(), "192.168.10.21/24");
    }
}
