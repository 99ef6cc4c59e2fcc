//! Session layer shared by every layer-3 node
//!
//! Turns outbound payloads into frames, resolves next hops (ARP cache,
//! connected subnets, route table, default gateway), parks frames while ARP
//! resolves, and hands inbound payloads to the software manager.

use std::net::Ipv4Addr;

use super::{Node, ParkedFrame};
use crate::frame::{ArpPacket, Frame, FrameBuilder, IcmpPacket, IcmpType, IpProtocol, MacAddress, ARP_PORT};
use crate::software::{InboundPayload, OutboundPayload};

/// Rounds of dispatch and send per flush before the node gives up
const MAX_FLUSH_ROUNDS: usize = 64;

impl Node {
    /// Drain software output onto the wire until no software has more to say
    pub fn flush_outbound(&mut self) {
        if !self.context.operational {
            self.context.take_outbound();
            self.context.take_relayed();
            return;
        }
        for _ in 0..MAX_FLUSH_ROUNDS {
            let Node {
                context,
                software_manager,
                ..
            } = self;
            software_manager.dispatch_events(context);
            let outbound = self.context.take_outbound();
            let relayed = self.context.take_relayed();
            if outbound.is_empty() && relayed.is_empty() {
                return;
            }
            for payload in outbound {
                self.send_payload(payload);
            }
            for relayed in relayed {
                self.apply_relayed(relayed);
            }
        }
        let dropped = self.context.take_outbound().len();
        self.context
            .sys_log
            .error(format!("Outbound flush did not settle, dropped {} payload(s)", dropped));
    }

    /// Egress port and next hop for `dst_ip_address`
    pub fn route_lookup(&self, dst_ip_address: Ipv4Addr) -> Option<(usize, Ipv4Addr)> {
        let enabled = |port_num: usize| {
            self.network_interfaces
                .get(&port_num)
                .map_or(false, |interface| interface.is_enabled())
        };
        let connected = |address: Ipv4Addr| {
            self.network_interfaces
                .values()
                .filter(|interface| interface.is_enabled())
                .find(|interface| interface.ip_config().map_or(false, |ip| ip.contains(address)))
                .map(|interface| interface.port_num)
        };

        if let Some(entry) = self
            .software_manager
            .arp()
            .and_then(|arp| arp.get_arp_cache_entry(dst_ip_address))
        {
            if enabled(entry.port_num) {
                return Some((entry.port_num, dst_ip_address));
            }
        }
        if let Some(port_num) = connected(dst_ip_address) {
            return Some((port_num, dst_ip_address));
        }
        if let Some(route_table) = self.kind.route_table() {
            if let Some(route) = route_table.find_best_route(dst_ip_address) {
                if let Some(port_num) = connected(route.next_hop_ip_address) {
                    return Some((port_num, route.next_hop_ip_address));
                }
            }
        }
        let gateway = self
            .kind
            .route_table()
            .and_then(|route_table| route_table.default_route)
            .or(self.default_gateway)?;
        connected(gateway).map(|port_num| (port_num, gateway))
    }

    /// Send `count` echo requests to `target`; false if nothing could be sent
    pub fn ping(&mut self, target: Ipv4Addr, count: u32) -> bool {
        if !self.software_manager.service_running("icmp") {
            self.context.sys_log.warning("Cannot ping: ICMP service is not running");
            return false;
        }
        let Some(icmp) = self.software_manager.icmp_mut() else {
            return false;
        };
        let identifier = icmp.start_ping(target, count);
        self.context.sys_log.info(format!("Pinging {}", target));

        if self.context.ip_addresses.contains(&target) {
            if let Some(icmp) = self.software_manager.icmp_mut() {
                for _ in 0..count {
                    icmp.record_reply(target, identifier);
                }
            }
            return true;
        }
        let Some((port_num, next_hop)) = self.route_lookup(target) else {
            self.context.sys_log.warning(format!("Cannot ping {}: no route", target));
            return false;
        };
        for sequence in 0..count {
            let echo = IcmpPacket {
                icmp_type: IcmpType::EchoRequest,
                identifier,
                sequence,
            };
            if let Some(frame) = self.icmp_frame(port_num, target, echo) {
                self.send_via(port_num, next_hop, frame);
            }
        }
        true
    }

    fn icmp_frame(&mut self, port_num: usize, dst_ip_address: Ipv4Addr, icmp: IcmpPacket) -> Option<Frame> {
        let interface = self.network_interfaces.get(&port_num)?;
        let src_ip_address = interface.ip_address()?;
        let built = FrameBuilder::new(
            interface.mac_address,
            MacAddress::BROADCAST,
            src_ip_address,
            dst_ip_address,
            IpProtocol::Icmp,
            self.default_ttl,
        )
        .icmp(icmp)
        .build();
        match built {
            Ok(frame) => Some(frame),
            Err(error) => {
                self.context.sys_log.error(format!("Cannot build ICMP frame: {}", error));
                None
            }
        }
    }

    fn send_payload(&mut self, outbound: OutboundPayload) {
        let dst_ip_address = outbound.dst_ip_address;
        if self.context.ip_addresses.contains(&dst_ip_address) {
            let inbound = InboundPayload {
                payload: outbound.payload,
                src_ip_address: dst_ip_address,
                src_port: outbound.src_port,
                dst_port: outbound.dst_port,
                protocol: outbound.protocol,
            };
            let Node {
                context,
                software_manager,
                ..
            } = self;
            software_manager.receive_payload(context, &inbound);
            return;
        }
        let Some((port_num, next_hop)) = self.route_lookup(dst_ip_address) else {
            self.context
                .sys_log
                .warning(format!("Cannot send to {}: no route", dst_ip_address));
            return;
        };
        let Some(interface) = self.network_interfaces.get(&port_num) else {
            return;
        };
        let Some(src_ip_address) = interface.ip_address() else {
            return;
        };
        let builder = FrameBuilder::new(
            interface.mac_address,
            MacAddress::BROADCAST,
            src_ip_address,
            dst_ip_address,
            outbound.protocol,
            self.default_ttl,
        );
        let builder = match outbound.protocol {
            IpProtocol::Tcp => builder.tcp(outbound.src_port, outbound.dst_port),
            IpProtocol::Udp => builder.udp(outbound.src_port, outbound.dst_port),
            IpProtocol::Icmp => {
                self.context.sys_log.error("Software cannot send raw ICMP payloads");
                return;
            }
        };
        match builder.payload(outbound.payload).build() {
            Ok(frame) => self.send_via(port_num, next_hop, frame),
            Err(error) => self.context.sys_log.error(format!("Cannot build frame: {}", error)),
        }
    }

    /// Transmit towards `next_hop`, resolving its MAC address first if needed
    pub(crate) fn send_via(&mut self, port_num: usize, next_hop: Ipv4Addr, frame: Frame) {
        let cached = self
            .software_manager
            .arp()
            .and_then(|arp| arp.get_arp_cache_mac_address(next_hop));
        if let Some(mac_address) = cached {
            self.transmit(port_num, mac_address, frame);
            return;
        }
        if !self.software_manager.service_running("arp") {
            self.context
                .sys_log
                .warning(format!("Cannot resolve {}: ARP service is not running", next_hop));
            return;
        }
        self.parked.push(ParkedFrame {
            next_hop,
            port_num,
            frame,
        });
        if self.arp_requested.insert(next_hop) {
            self.send_arp_request(port_num, next_hop);
        }
    }

    fn send_arp_request(&mut self, port_num: usize, target_ip_address: Ipv4Addr) {
        let Some(interface) = self.network_interfaces.get(&port_num) else {
            return;
        };
        let Some(src_ip_address) = interface.ip_address() else {
            return;
        };
        let request = ArpPacket::request(interface.mac_address, src_ip_address, target_ip_address);
        let built = FrameBuilder::new(
            interface.mac_address,
            MacAddress::BROADCAST,
            src_ip_address,
            target_ip_address,
            IpProtocol::Udp,
            self.default_ttl,
        )
        .udp(ARP_PORT, ARP_PORT)
        .arp(request)
        .build();
        match built {
            Ok(frame) => {
                self.context
                    .sys_log
                    .debug(format!("Sending ARP request for {} on port {}", target_ip_address, port_num));
                self.transmit(port_num, MacAddress::BROADCAST, frame);
            }
            Err(error) => self.context.sys_log.error(format!("Cannot build ARP request: {}", error)),
        }
    }

    /// Put `frame` on the outbox of `port_num` addressed to `dst_mac_addr`
    pub(crate) fn transmit(&mut self, port_num: usize, dst_mac_addr: MacAddress, mut frame: Frame) {
        let timestep = self.context.timestep;
        let Some(interface) = self.network_interfaces.get_mut(&port_num) else {
            return;
        };
        frame.readdress(interface.mac_address, dst_mac_addr);
        if let Some(frame) = interface.send_frame(frame, timestep) {
            self.outbox.push((port_num, frame));
        }
    }

    /// Record `ip_address` as reachable at `mac_address` and release parked frames
    pub(crate) fn learn(&mut self, ip_address: Ipv4Addr, mac_address: MacAddress, port_num: usize) {
        if !self.software_manager.service_running("arp") {
            return;
        }
        let Some(arp) = self.software_manager.arp_mut() else {
            return;
        };
        arp.add_arp_cache_entry(ip_address, mac_address, port_num);
        let (ready, waiting): (Vec<ParkedFrame>, Vec<ParkedFrame>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|parked| parked.next_hop == ip_address);
        self.parked = waiting;
        self.arp_requested.remove(&ip_address);
        for parked in ready {
            self.transmit(parked.port_num, mac_address, parked.frame);
        }
    }

    /// Learn the sender of a frame that arrived from a directly connected host
    pub(crate) fn learn_sender(&mut self, port_num: usize, frame: &Frame) {
        let src_ip_address = frame.ip().src_ip_address;
        let connected = self
            .network_interfaces
            .get(&port_num)
            .and_then(|interface| interface.ip_config())
            .map_or(false, |ip| ip.contains(src_ip_address));
        if connected {
            self.learn(src_ip_address, frame.ethernet().src_mac_addr, port_num);
        }
    }

    pub(crate) fn handle_arp(&mut self, port_num: usize, arp: ArpPacket) {
        if !self.software_manager.service_running("arp") {
            return;
        }
        let Some(interface) = self.network_interfaces.get(&port_num) else {
            return;
        };
        let (Some(own_ip_address), own_mac_address) = (interface.ip_address(), interface.mac_address) else {
            return;
        };
        if arp.target_ip_address != own_ip_address {
            return;
        }
        self.learn(arp.sender_ip_address, arp.sender_mac_addr, port_num);
        if !arp.request {
            return;
        }
        let built = FrameBuilder::new(
            own_mac_address,
            arp.sender_mac_addr,
            own_ip_address,
            arp.sender_ip_address,
            IpProtocol::Udp,
            self.default_ttl,
        )
        .udp(ARP_PORT, ARP_PORT)
        .arp(arp.reply(own_mac_address))
        .build();
        match built {
            Ok(frame) => self.transmit(port_num, arp.sender_mac_addr, frame),
            Err(error) => self.context.sys_log.error(format!("Cannot build ARP reply: {}", error)),
        }
    }

    /// Frames addressed to one of this node's own IP addresses
    pub(crate) fn deliver_locally(&mut self, port_num: usize, frame: Frame) {
        if let Some(arp) = frame.arp().copied() {
            self.handle_arp(port_num, arp);
            return;
        }
        let ip = *frame.ip();
        match frame.protocol() {
            IpProtocol::Icmp => {
                let Some(icmp) = frame.icmp().copied() else {
                    return;
                };
                match icmp.icmp_type {
                    IcmpType::EchoRequest => {
                        if !self.software_manager.service_running("icmp") {
                            return;
                        }
                        let Some((egress, next_hop)) = self.route_lookup(ip.src_ip_address) else {
                            return;
                        };
                        let reply = IcmpPacket {
                            icmp_type: IcmpType::EchoReply,
                            ..icmp
                        };
                        if let Some(frame) = self.icmp_frame(egress, ip.src_ip_address, reply) {
                            self.send_via(egress, next_hop, frame);
                        }
                    }
                    IcmpType::EchoReply => {
                        if let Some(icmp_service) = self.software_manager.icmp_mut() {
                            icmp_service.record_reply(ip.src_ip_address, icmp.identifier);
                        }
                    }
                }
            }
            IpProtocol::Tcp | IpProtocol::Udp => {
                let (Some(src_port), Some(dst_port)) = (frame.src_port(), frame.dst_port()) else {
                    return;
                };
                let inbound = InboundPayload {
                    payload: frame.into_payload(),
                    src_ip_address: ip.src_ip_address,
                    src_port,
                    dst_port,
                    protocol: ip.protocol,
                };
                let Node {
                    context,
                    software_manager,
                    ..
                } = self;
                software_manager.receive_payload(context, &inbound);
            }
        }
    }

    pub(crate) fn process_host_frame(&mut self, port_num: usize, frame: Frame) {
        if let Some(arp) = frame.arp().copied() {
            self.handle_arp(port_num, arp);
            return;
        }
        if !self.context.ip_addresses.contains(&frame.ip().dst_ip_address) {
            return;
        }
        self.deliver_locally(port_num, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::node::NodeKind;

    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn host(hostname: &str, ip_address: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Node {
        Node::host(hostname, NodeKind::Computer, ip_address, MASK, gateway, &SimConfig::default())
    }

    /// Shuttle frames between two directly cabled hosts until both are quiet
    fn exchange(a: &mut Node, b: &mut Node) {
        for _ in 0..16 {
            let from_a = a.take_outbox();
            let from_b = b.take_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (_, frame) in from_a {
                b.receive_frame(1, frame);
            }
            for (_, frame) in from_b {
                a.receive_frame(1, frame);
            }
        }
    }

    #[test]
    fn test_route_lookup_prefers_connected_then_gateway() {
        let node = host("pc", Ipv4Addr::new(192, 168, 1, 10), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(
            node.route_lookup(Ipv4Addr::new(192, 168, 1, 20)),
            Some((1, Ipv4Addr::new(192, 168, 1, 20)))
        );
        assert_eq!(
            node.route_lookup(Ipv4Addr::new(10, 0, 0, 1)),
            Some((1, Ipv4Addr::new(192, 168, 1, 1)))
        );
        let isolated = host("pc2", Ipv4Addr::new(192, 168, 1, 11), None);
        assert_eq!(isolated.route_lookup(Ipv4Addr::new(10, 0, 0, 1)), None);
    }

    #[test]
    fn test_first_ping_resolves_arp_then_replies() {
        let mut a = host("pc_a", Ipv4Addr::new(192, 168, 1, 10), None);
        let mut b = host("pc_b", Ipv4Addr::new(192, 168, 1, 20), None);

        assert!(a.ping(Ipv4Addr::new(192, 168, 1, 20), 4));
        // only the ARP request leaves before resolution
        let outbox = a.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].1.arp().is_some());
        for (_, frame) in outbox {
            b.receive_frame(1, frame);
        }
        exchange(&mut a, &mut b);

        let record = a
            .software_manager
            .icmp()
            .and_then(|icmp| icmp.ping_record(Ipv4Addr::new(192, 168, 1, 20)))
            .expect("ping started");
        assert!(record.all_replied());
        assert!(b
            .software_manager
            .arp()
            .and_then(|arp| arp.get_arp_cache_entry(Ipv4Addr::new(192, 168, 1, 10)))
            .is_some());
    }

    #[test]
    fn test_stopped_arp_cannot_resolve() {
        let mut a = host("pc_a", Ipv4Addr::new(192, 168, 1, 10), None);
        let Node {
            context,
            software_manager,
            ..
        } = &mut a;
        if let Some(arp) = software_manager.service_mut("arp") {
            arp.stop(context);
        }
        a.ping(Ipv4Addr::new(192, 168, 1, 20), 1);
        assert!(a.take_outbox().is_empty());
        assert!(a.context.sys_log.contains("ARP service is not running"));
    }

    #[test]
    fn test_parked_frames_dropped_at_next_step() {
        let mut a = host("pc_a", Ipv4Addr::new(192, 168, 1, 10), None);
        a.ping(Ipv4Addr::new(192, 168, 1, 99), 2);
        assert_eq!(a.parked.len(), 2);
        a.pre_timestep(1);
        assert!(a.parked.is_empty());
        assert!(a.arp_requested.is_empty());
    }

    #[test]
    fn test_unanswered_arp_is_sent_again_after_network_idle() {
        let mut a = host("pc_a", Ipv4Addr::new(192, 168, 1, 10), None);
        a.ping(Ipv4Addr::new(192, 168, 1, 99), 1);
        assert_eq!(a.take_outbox().len(), 1);
        a.ping(Ipv4Addr::new(192, 168, 1, 99), 1);
        assert!(a.take_outbox().is_empty());

        a.network_idle();
        assert!(a.parked.is_empty());
        a.ping(Ipv4Addr::new(192, 168, 1, 99), 1);
        let outbox = a.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].1.arp().is_some());
    }
}
