//! Simulated network traffic
//!
//! A [`Frame`] layers an Ethernet header, an IP packet and at most one
//! transport header (TCP, UDP or ICMP) around an application [`Payload`].
//! Frames are only constructed through [`FrameBuilder`], which refuses
//! combinations where the declared IP protocol has no matching header.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Serialize, Serializer};

use crate::error::FrameError;
use crate::protocols::Payload;

pub type Port = u16;

// Well-known ports used by the built-in software
pub const FTP_PORT: Port = 21;
pub const SSH_PORT: Port = 22;
pub const SMTP_PORT: Port = 25;
pub const DNS_PORT: Port = 53;
pub const HTTP_PORT: Port = 80;
pub const NTP_PORT: Port = 123;
pub const ARP_PORT: Port = 219;
pub const HTTPS_PORT: Port = 443;
pub const POSTGRES_PORT: Port = 5432;

/// Resolve a well-known port name such as "HTTP" or "POSTGRES_SERVER"
pub fn port_from_name(name: &str) -> Option<Port> {
    match name.to_ascii_uppercase().as_str() {
        "FTP" => Some(FTP_PORT),
        "SSH" => Some(SSH_PORT),
        "SMTP" => Some(SMTP_PORT),
        "DNS" => Some(DNS_PORT),
        "HTTP" => Some(HTTP_PORT),
        "NTP" => Some(NTP_PORT),
        "ARP" => Some(ARP_PORT),
        "HTTPS" => Some(HTTPS_PORT),
        "POSTGRES_SERVER" | "POSTGRES" => Some(POSTGRES_PORT),
        other => other.parse().ok(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl IpProtocol {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TCP" => Some(IpProtocol::Tcp),
            "UDP" => Some(IpProtocol::Udp),
            "ICMP" => Some(IpProtocol::Icmp),
            _ => None,
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmp => write!(f, "ICMP"),
        }
    }
}

/// 64-bit FNV-1a, used wherever a stable hash of a name is needed
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ============================================================================
// MAC ADDRESSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Deterministic, locally administered address for a node port
    pub fn derived(hostname: &str, port: usize) -> Self {
        let hash = fnv1a(format!("{}/{}", hostname, port).as_bytes()).to_be_bytes();
        // locally administered, unicast
        Self([(hash[0] & 0xfc) | 0x02, hash[1], hash[2], hash[3], hash[4], hash[5]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// HEADERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EthernetHeader {
    pub src_mac_addr: MacAddress,
    pub dst_mac_addr: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpPacket {
    pub src_ip_address: Ipv4Addr,
    pub dst_ip_address: Ipv4Addr,
    pub protocol: IpProtocol,
    pub ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TcpHeader {
    pub src_port: Port,
    pub dst_port: Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UdpHeader {
    pub src_port: Port,
    pub dst_port: Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IcmpType {
    EchoRequest,
    EchoReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IcmpPacket {
    pub icmp_type: IcmpType,
    /// Identifies the ping session the echo belongs to
    pub identifier: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArpPacket {
    /// true for a request, false for a reply
    pub request: bool,
    pub sender_mac_addr: MacAddress,
    pub sender_ip_address: Ipv4Addr,
    pub target_ip_address: Ipv4Addr,
    pub target_mac_addr: Option<MacAddress>,
}

impl ArpPacket {
    pub fn request(sender_mac_addr: MacAddress, sender_ip_address: Ipv4Addr, target_ip_address: Ipv4Addr) -> Self {
        Self {
            request: true,
            sender_mac_addr,
            sender_ip_address,
            target_ip_address,
            target_mac_addr: None,
        }
    }

    /// Reply to this request on behalf of `mac_addr`
    pub fn reply(&self, mac_addr: MacAddress) -> Self {
        Self {
            request: false,
            sender_mac_addr: mac_addr,
            sender_ip_address: self.target_ip_address,
            target_ip_address: self.sender_ip_address,
            target_mac_addr: Some(self.sender_mac_addr),
        }
    }
}

// ============================================================================
// FRAME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    ethernet: EthernetHeader,
    ip: IpPacket,
    tcp: Option<TcpHeader>,
    udp: Option<UdpHeader>,
    icmp: Option<IcmpPacket>,
    arp: Option<ArpPacket>,
    payload: Payload,
    sent_timestamp: Option<u64>,
    received_timestamp: Option<u64>,
}

impl Frame {
    pub fn ethernet(&self) -> &EthernetHeader {
        &self.ethernet
    }

    pub fn ip(&self) -> &IpPacket {
        &self.ip
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        self.tcp.as_ref()
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        self.udp.as_ref()
    }

    pub fn icmp(&self) -> Option<&IcmpPacket> {
        self.icmp.as_ref()
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        self.arp.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn protocol(&self) -> IpProtocol {
        self.ip.protocol
    }

    pub fn ttl(&self) -> u8 {
        self.ip.ttl
    }

    pub fn src_port(&self) -> Option<Port> {
        self.tcp
            .map(|tcp| tcp.src_port)
            .or_else(|| self.udp.map(|udp| udp.src_port))
    }

    pub fn dst_port(&self) -> Option<Port> {
        self.tcp
            .map(|tcp| tcp.dst_port)
            .or_else(|| self.udp.map(|udp| udp.dst_port))
    }

    pub fn is_broadcast(&self) -> bool {
        self.ethernet.dst_mac_addr.is_broadcast()
    }

    pub fn decrement_ttl(&mut self) {
        self.ip.ttl = self.ip.ttl.saturating_sub(1);
    }

    /// A frame with no hops left must not be handed on
    pub fn can_transmit(&self) -> bool {
        self.ip.ttl >= 1
    }

    pub fn sent_timestamp(&self) -> Option<u64> {
        self.sent_timestamp
    }

    pub fn received_timestamp(&self) -> Option<u64> {
        self.received_timestamp
    }

    pub fn set_sent_timestamp(&mut self, timestep: u64) {
        self.sent_timestamp = Some(timestep);
    }

    pub fn set_received_timestamp(&mut self, timestep: u64) {
        self.received_timestamp = Some(timestep);
    }

    /// Rewrite the link-layer addresses for the next hop
    pub fn readdress(&mut self, src_mac_addr: MacAddress, dst_mac_addr: MacAddress) {
        self.ethernet = EthernetHeader {
            src_mac_addr,
            dst_mac_addr,
        };
    }

    pub fn size_bytes(&self) -> u64 {
        // ethernet + ip headers, then the transport header
        let mut size = 14 + 20;
        if self.tcp.is_some() {
            size += 20;
        }
        if self.udp.is_some() || self.icmp.is_some() {
            size += 8;
        }
        if self.arp.is_some() {
            size += 28;
        }
        size + self.payload.size_bytes()
    }

    pub fn size_mbits(&self) -> f64 {
        (self.size_bytes() * 8) as f64 / 1_000_000.0
    }
}

pub struct FrameBuilder {
    ethernet: EthernetHeader,
    ip: IpPacket,
    tcp: Option<TcpHeader>,
    udp: Option<UdpHeader>,
    icmp: Option<IcmpPacket>,
    arp: Option<ArpPacket>,
    payload: Payload,
}

impl FrameBuilder {
    pub fn new(
        src_mac_addr: MacAddress,
        dst_mac_addr: MacAddress,
        src_ip_address: Ipv4Addr,
        dst_ip_address: Ipv4Addr,
        protocol: IpProtocol,
        ttl: u8,
    ) -> Self {
        Self {
            ethernet: EthernetHeader {
                src_mac_addr,
                dst_mac_addr,
            },
            ip: IpPacket {
                src_ip_address,
                dst_ip_address,
                protocol,
                ttl,
            },
            tcp: None,
            udp: None,
            icmp: None,
            arp: None,
            payload: Payload::None,
        }
    }

    pub fn tcp(mut self, src_port: Port, dst_port: Port) -> Self {
        self.tcp = Some(TcpHeader { src_port, dst_port });
        self
    }

    pub fn udp(mut self, src_port: Port, dst_port: Port) -> Self {
        self.udp = Some(UdpHeader { src_port, dst_port });
        self
    }

    pub fn icmp(mut self, icmp: IcmpPacket) -> Self {
        self.icmp = Some(icmp);
        self
    }

    pub fn arp(mut self, arp: ArpPacket) -> Self {
        self.arp = Some(arp);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> Result<Frame, FrameError> {
        if self.tcp.is_some() && self.udp.is_some() {
            return Err(FrameError::ConflictingTransport);
        }
        let protocol = self.ip.protocol;
        let missing = match protocol {
            IpProtocol::Tcp if self.tcp.is_none() => Some("TCP"),
            IpProtocol::Udp if self.udp.is_none() => Some("UDP"),
            IpProtocol::Icmp if self.icmp.is_none() => Some("ICMP"),
            _ => None,
        };
        if let Some(header) = missing {
            return Err(FrameError::MissingHeader { protocol, header });
        }
        Ok(Frame {
            ethernet: self.ethernet,
            ip: self.ip,
            tcp: self.tcp,
            udp: self.udp,
            icmp: self.icmp,
            arp: self.arp,
            payload: self.payload,
            sent_timestamp: None,
            received_timestamp: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(protocol: IpProtocol) -> FrameBuilder {
        FrameBuilder::new(
            MacAddress::derived("client_1", 1),
            MacAddress::derived("server_1", 1),
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(192, 168, 1, 3),
            protocol,
            64,
        )
    }

    #[test]
    fn test_declared_protocol_requires_matching_header() {
        assert_eq!(
            builder(IpProtocol::Tcp).build(),
            Err(FrameError::MissingHeader {
                protocol: IpProtocol::Tcp,
                header: "TCP"
            })
        );
        assert!(builder(IpProtocol::Udp).tcp(1, 2).build().is_err());
        assert!(builder(IpProtocol::Icmp).build().is_err());
        assert!(builder(IpProtocol::Tcp).tcp(1, 80).build().is_ok());
    }

    #[test]
    fn test_tcp_and_udp_together_are_rejected() {
        let result = builder(IpProtocol::Tcp).tcp(1, 80).udp(1, 80).build();
        assert_eq!(result, Err(FrameError::ConflictingTransport));
    }

    #[test]
    fn test_ttl_decrements_to_zero_then_stops_transmitting() {
        let mut frame = FrameBuilder::new(
            MacAddress::derived("a", 1),
            MacAddress::BROADCAST,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IpProtocol::Udp,
            2,
        )
        .udp(ARP_PORT, ARP_PORT)
        .build()
        .expect("valid frame");
        assert!(frame.is_broadcast());
        frame.decrement_ttl();
        assert!(frame.can_transmit());
        frame.decrement_ttl();
        assert!(!frame.can_transmit());
        frame.decrement_ttl();
        assert_eq!(frame.ttl(), 0);
    }

    #[test]
    fn test_derived_mac_is_stable_and_unicast() {
        let mac = MacAddress::derived("router_1", 2);
        assert_eq!(mac, MacAddress::derived("router_1", 2));
        assert_ne!(mac, MacAddress::derived("router_1", 1));
        assert_eq!(mac.octets()[0] & 0x01, 0);
        assert_eq!(mac.to_string().len(), 17);
    }

    #[test]
    fn test_port_names() {
        assert_eq!(port_from_name("HTTP"), Some(80));
        assert_eq!(port_from_name("postgres_server"), Some(5432));
        assert_eq!(port_from_name("8080"), Some(8080));
        assert_eq!(port_from_name("bogus"), None);
    }
}
