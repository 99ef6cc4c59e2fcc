//! Firewalls
//!
//! Three zones, each on a fixed port: external (1), internal (2) and DMZ (3).
//! Each zone has an inbound and an outbound ACL. Inbound means traffic
//! entering the zone from the firewall; outbound means traffic leaving the
//! zone into the firewall. A frame is checked once as it arrives and, when
//! it crosses into a different zone, once more as it leaves.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use super::{load_acl_rules, router_acl, Node, NodeKind, RouteTable};
use crate::acl::{AccessControlList, AclAction};
use crate::config::NodeConfig;
use crate::error::{ConfigError, RequestError};
use crate::frame::Frame;
use crate::request::{arg_str, RequestContext, RequestHandler, RequestResponse, RequestToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FirewallZone {
    External = 1,
    Internal = 2,
    Dmz = 3,
}

impl FirewallZone {
    pub const ALL: [FirewallZone; 3] = [FirewallZone::External, FirewallZone::Internal, FirewallZone::Dmz];

    pub fn port_num(self) -> usize {
        self as usize
    }

    pub fn from_port(port_num: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|zone| zone.port_num() == port_num)
    }

    pub fn name(self) -> &'static str {
        match self {
            FirewallZone::External => "external",
            FirewallZone::Internal => "internal",
            FirewallZone::Dmz => "dmz",
        }
    }
}

impl fmt::Display for FirewallZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AclDirection {
    Inbound,
    Outbound,
}

impl AclDirection {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "inbound" => Some(AclDirection::Inbound),
            "outbound" => Some(AclDirection::Outbound),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AclDirection::Inbound => "inbound",
            AclDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirewallState {
    pub route_table: RouteTable,
    acls: BTreeMap<(FirewallZone, AclDirection), AccessControlList>,
}

impl FirewallState {
    pub fn new(max_acl_rules: usize) -> Self {
        let mut acls = BTreeMap::new();
        for zone in FirewallZone::ALL {
            let implicit_action = match zone {
                FirewallZone::External => AclAction::Permit,
                FirewallZone::Internal | FirewallZone::Dmz => AclAction::Deny,
            };
            for direction in [AclDirection::Inbound, AclDirection::Outbound] {
                let name = format!("{}_{}", zone.name(), direction.name());
                acls.insert((zone, direction), router_acl(&name, implicit_action, max_acl_rules));
            }
        }
        Self {
            route_table: RouteTable::default(),
            acls,
        }
    }

    pub fn acl(&self, zone: FirewallZone, direction: AclDirection) -> Option<&AccessControlList> {
        self.acls.get(&(zone, direction))
    }

    pub fn acl_mut(&mut self, zone: FirewallZone, direction: AclDirection) -> Option<&mut AccessControlList> {
        self.acls.get_mut(&(zone, direction))
    }

    /// Zone ACLs come from keys such as `internal_inbound`
    pub(crate) fn configure(&mut self, config: &NodeConfig) -> Result<(), ConfigError> {
        for (key, rules) in &config.zone_acls {
            let acl = key
                .split_once('_')
                .and_then(|(zone, direction)| {
                    let zone = FirewallZone::ALL.into_iter().find(|candidate| candidate.name() == zone)?;
                    Some((zone, AclDirection::from_name(direction)?))
                })
                .and_then(|(zone, direction)| self.acls.get_mut(&(zone, direction)))
                .ok_or_else(|| ConfigError::InvalidNode {
                    hostname: config.hostname.clone(),
                    reason: format!("unknown firewall ACL {}", key),
                })?;
            load_acl_rules(acl, rules)?;
        }
        for route in &config.routes {
            self.route_table.add_route(super::Route {
                address: route.address,
                subnet_mask: route.subnet_mask,
                next_hop_ip_address: route.next_hop_ip_address,
                metric: route.metric,
            });
        }
        self.route_table.default_route = config.default_route;
        Ok(())
    }

    pub(crate) fn check_valid(&self, zone: FirewallZone, request: &[RequestToken], context: &RequestContext) -> bool {
        let Some((direction, rest)) = split_zone_request(request) else {
            return false;
        };
        self.acl(zone, direction)
            .map_or(false, |acl| acl.check_valid(&(), rest, context))
    }

    pub(crate) fn describe_state(&self, state: &mut Map<String, Value>) {
        let acls: Map<String, Value> = self
            .acls
            .values()
            .map(|acl| (acl.name.clone(), acl.describe_state()))
            .collect();
        state.insert("acls".to_string(), Value::Object(acls));
        state.insert("route_table".to_string(), self.route_table.describe_state());
    }
}

/// `[inbound|outbound, "acl", ...]` into the direction and the ACL request
fn split_zone_request(request: &[RequestToken]) -> Option<(AclDirection, &[RequestToken])> {
    let direction = request.first()?.as_str().and_then(AclDirection::from_name)?;
    if request.get(1)?.as_str() != Some("acl") {
        return None;
    }
    Some((direction, &request[2..]))
}

pub(crate) fn firewall_zone_request(
    node: &mut Node,
    zone: FirewallZone,
    request: &[RequestToken],
    context: &RequestContext,
) -> Result<RequestResponse, RequestError> {
    let direction = arg_str(request, 0, "firewall", "direction")?;
    let Some((direction, rest)) = split_zone_request(request) else {
        return Err(RequestError::UnknownRequest {
            token: direction,
            available: "inbound acl, outbound acl".to_string(),
        });
    };
    let NodeKind::Firewall(firewall) = &mut node.kind else {
        return Ok(RequestResponse::failure().with_reason("node is not a firewall"));
    };
    match firewall.acl_mut(zone, direction) {
        Some(acl) => acl.handle_request(&mut (), rest, context),
        None => Ok(RequestResponse::failure()),
    }
}

impl Node {
    pub(crate) fn firewall_frame(&mut self, port_num: usize, frame: Frame) {
        let Some(ingress_zone) = FirewallZone::from_port(port_num) else {
            return;
        };
        let ingress_direction = match ingress_zone {
            FirewallZone::External => AclDirection::Inbound,
            FirewallZone::Internal | FirewallZone::Dmz => AclDirection::Outbound,
        };
        if !self.firewall_permits(ingress_zone, ingress_direction, &frame) {
            return;
        }
        self.learn_sender(port_num, &frame);
        if frame.arp().is_some() || self.context.ip_addresses.contains(&frame.ip().dst_ip_address) {
            self.deliver_locally(port_num, frame);
            return;
        }

        let dst_ip_address = frame.ip().dst_ip_address;
        let Some((egress, next_hop)) = self.route_lookup(dst_ip_address) else {
            self.context
                .sys_log
                .info(format!("Frame to {} dropped: no route", dst_ip_address));
            return;
        };
        if let Some(egress_zone) = FirewallZone::from_port(egress) {
            if egress_zone != ingress_zone {
                let egress_direction = match egress_zone {
                    FirewallZone::External => AclDirection::Outbound,
                    FirewallZone::Internal | FirewallZone::Dmz => AclDirection::Inbound,
                };
                if !self.firewall_permits(egress_zone, egress_direction, &frame) {
                    return;
                }
            }
        }
        self.send_via(egress, next_hop, frame);
    }

    fn firewall_permits(&mut self, zone: FirewallZone, direction: AclDirection, frame: &Frame) -> bool {
        let NodeKind::Firewall(firewall) = &mut self.kind else {
            return false;
        };
        let Some(acl) = firewall.acl_mut(zone, direction) else {
            return false;
        };
        let decision = acl.is_permitted(frame);
        if !decision.permitted {
            self.context.sys_log.info(format!(
                "Frame blocked at {} {} by rule {}",
                zone,
                direction.name(),
                decision
            ));
        }
        decision.permitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclRule;
    use crate::config::{AclRuleConfig, PortConfig, PortSpec, SimConfig};
    use crate::frame::{IpProtocol, ARP_PORT};
    use crate::node::PING_COUNT;
    use crate::request;
    use std::net::Ipv4Addr;

    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn arp_rule() -> AclRuleConfig {
        AclRuleConfig {
            action: "PERMIT".to_string(),
            protocol: None,
            src_ip: None,
            src_wildcard_mask: None,
            dst_ip: None,
            dst_wildcard_mask: None,
            src_port: Some(PortSpec::Name("ARP".to_string())),
            dst_port: Some(PortSpec::Number(ARP_PORT)),
        }
    }

    fn firewall() -> Node {
        let mut config = NodeConfig::new("firewall", "firewall_1");
        for (port, third_octet) in [(1, 0), (2, 1), (3, 2)] {
            config.ports.insert(
                port,
                PortConfig {
                    ip_address: Ipv4Addr::new(192, 168, third_octet, 1),
                    subnet_mask: MASK,
                },
            );
        }
        for key in ["internal_outbound", "internal_inbound", "dmz_outbound", "dmz_inbound"] {
            config.zone_acls.entry(key.to_string()).or_default().insert(1, arp_rule());
        }
        Node::from_config(&config, &SimConfig::default()).expect("valid firewall")
    }

    fn host(hostname: &str, third_octet: u8) -> Node {
        Node::host(
            hostname,
            NodeKind::Computer,
            Ipv4Addr::new(192, 168, third_octet, 10),
            MASK,
            Some(Ipv4Addr::new(192, 168, third_octet, 1)),
            &SimConfig::default(),
        )
    }

    /// hosts[i] sits on firewall port i + 1
    fn run(firewall: &mut Node, hosts: &mut [Node; 3]) {
        for _ in 0..32 {
            let mut moved = false;
            for (index, host) in hosts.iter_mut().enumerate() {
                for (_, frame) in host.take_outbox() {
                    moved = true;
                    firewall.receive_frame(index + 1, frame);
                }
            }
            for (port, frame) in firewall.take_outbox() {
                moved = true;
                hosts[port - 1].receive_frame(1, frame);
            }
            if !moved {
                return;
            }
        }
    }

    fn replied(node: &Node, target: Ipv4Addr) -> bool {
        node.software_manager
            .icmp()
            .and_then(|icmp| icmp.ping_record(target))
            .map_or(false, |record| record.all_replied())
    }

    #[test]
    fn test_default_policy_blocks_external_to_internal() {
        let mut firewall = firewall();
        let mut hosts = [host("external_pc", 0), host("internal_pc", 1), host("dmz_pc", 2)];
        let internal = Ipv4Addr::new(192, 168, 1, 10);
        hosts[0].ping(internal, PING_COUNT);
        run(&mut firewall, &mut hosts);
        assert!(!replied(&hosts[0], internal));
        assert!(firewall.context.sys_log.contains("Frame blocked at internal inbound by rule implicit"));
    }

    #[test]
    fn test_zone_rules_open_internal_to_dmz() {
        let mut firewall = firewall();
        if let NodeKind::Firewall(state) = firewall.kind_mut() {
            for (zone, direction) in [
                (FirewallZone::Internal, AclDirection::Outbound),
                (FirewallZone::Internal, AclDirection::Inbound),
                (FirewallZone::Dmz, AclDirection::Outbound),
                (FirewallZone::Dmz, AclDirection::Inbound),
            ] {
                if let Some(acl) = state.acl_mut(zone, direction) {
                    acl.add_rule(2, AclRule::permit().protocol(IpProtocol::Icmp));
                }
            }
        }
        let mut hosts = [host("external_pc", 0), host("internal_pc", 1), host("dmz_pc", 2)];
        let dmz = Ipv4Addr::new(192, 168, 2, 10);
        hosts[1].ping(dmz, PING_COUNT);
        run(&mut firewall, &mut hosts);
        assert!(replied(&hosts[1], dmz));
    }

    #[test]
    fn test_zone_acl_requests() {
        let mut firewall = firewall();
        let context = RequestContext::new(0);
        let add = request![
            "internal", "inbound", "acl", "add_rule", "PERMIT", "TCP", "ALL", "ALL", "ALL", "ALL", "ALL", "HTTP", 5
        ];
        assert!(firewall.check_valid(&(), &add, &context));
        let response = firewall.handle_request(&mut (), &add, &context).expect("routed");
        assert!(response.is_success());
        let NodeKind::Firewall(state) = firewall.kind() else {
            panic!("expected a firewall");
        };
        assert!(state.acl(FirewallZone::Internal, AclDirection::Inbound).and_then(|acl| acl.get_rule(5)).is_some());
        assert!(!firewall.check_valid(&(), &request!["internal", "sideways", "acl", "remove_rule", 5], &context));
    }
}
