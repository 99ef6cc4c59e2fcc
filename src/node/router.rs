//! Routers
//!
//! Every frame a router accepts is checked against its ACL first. Permitted
//! frames either terminate at the router (ARP, ICMP, anything for one of its
//! own addresses) or are forwarded: ARP cache, connected subnets, best route
//! (longest prefix then lowest metric), then the default route.

use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::Value;

use super::{load_acl_rules, router_acl, Node, NodeKind};
use crate::acl::{AccessControlList, AclAction};
use crate::config::NodeConfig;
use crate::error::ConfigError;
use crate::frame::Frame;
use crate::interface::IpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Route {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub next_hop_ip_address: Ipv4Addr,
    pub metric: f64,
}

impl Route {
    fn network(&self) -> IpConfig {
        IpConfig::new(self.address, self.subnet_mask)
    }

    pub fn matches(&self, address: Ipv4Addr) -> bool {
        self.network().contains(address)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    pub default_route: Option<Ipv4Addr>,
}

impl RouteTable {
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Longest matching prefix wins; equal prefixes go to the lowest metric
    pub fn find_best_route(&self, address: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.matches(address))
            .fold(None, |best: Option<&Route>, route| match best {
                None => Some(route),
                Some(best) => {
                    let (best_len, len) = (best.network().prefix_len(), route.network().prefix_len());
                    if len > best_len || (len == best_len && route.metric < best.metric) {
                        Some(route)
                    } else {
                        Some(best)
                    }
                }
            })
    }

    pub fn describe_state(&self) -> Value {
        serde_json::json!({
            "routes": self.routes,
            "default_route": self.default_route.map(|ip| ip.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RouterState {
    pub acl: AccessControlList,
    pub route_table: RouteTable,
}

impl RouterState {
    pub fn new(max_acl_rules: usize) -> Self {
        Self {
            acl: router_acl("acl", AclAction::Deny, max_acl_rules),
            route_table: RouteTable::default(),
        }
    }

    pub(crate) fn configure(&mut self, config: &NodeConfig) -> Result<(), ConfigError> {
        load_acl_rules(&mut self.acl, &config.acl)?;
        for route in &config.routes {
            self.route_table.add_route(Route {
                address: route.address,
                subnet_mask: route.subnet_mask,
                next_hop_ip_address: route.next_hop_ip_address,
                metric: route.metric,
            });
        }
        self.route_table.default_route = config.default_route;
        Ok(())
    }
}

impl Node {
    pub(crate) fn router_frame(&mut self, port_num: usize, frame: Frame) {
        let (NodeKind::Router(state) | NodeKind::WirelessRouter(state)) = &mut self.kind else {
            return;
        };
        let decision = state.acl.is_permitted(&frame);
        if !decision.permitted {
            self.context
                .sys_log
                .info(format!("Frame blocked at port {} by rule {}", port_num, decision));
            return;
        }
        self.learn_sender(port_num, &frame);
        if frame.arp().is_some() || self.context.ip_addresses.contains(&frame.ip().dst_ip_address) {
            self.deliver_locally(port_num, frame);
            return;
        }
        self.forward(frame);
    }

    /// Send a transit frame on towards its destination
    pub(crate) fn forward(&mut self, frame: Frame) {
        let dst_ip_address = frame.ip().dst_ip_address;
        match self.route_lookup(dst_ip_address) {
            Some((egress, next_hop)) => self.send_via(egress, next_hop, frame),
            None => self
                .context
                .sys_log
                .info(format!("Frame to {} dropped: no route", dst_ip_address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclRule;
    use crate::config::{PortConfig, SimConfig};
    use crate::frame::{IpProtocol, ARP_PORT};
    use crate::node::PING_COUNT;

    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn route(address: [u8; 4], mask: [u8; 4], next_hop: [u8; 4], metric: f64) -> Route {
        Route {
            address: address.into(),
            subnet_mask: mask.into(),
            next_hop_ip_address: next_hop.into(),
            metric,
        }
    }

    #[test]
    fn test_longest_prefix_then_metric() {
        let mut table = RouteTable::default();
        table.add_route(route([10, 0, 0, 0], [255, 0, 0, 0], [192, 168, 1, 2], 1.0));
        table.add_route(route([10, 1, 0, 0], [255, 255, 0, 0], [192, 168, 1, 3], 5.0));
        table.add_route(route([10, 1, 0, 0], [255, 255, 0, 0], [192, 168, 1, 4], 2.0));

        let best = table.find_best_route(Ipv4Addr::new(10, 1, 2, 3)).expect("route");
        assert_eq!(best.next_hop_ip_address, Ipv4Addr::new(192, 168, 1, 4));
        let best = table.find_best_route(Ipv4Addr::new(10, 9, 0, 1)).expect("route");
        assert_eq!(best.next_hop_ip_address, Ipv4Addr::new(192, 168, 1, 2));
        assert!(table.find_best_route(Ipv4Addr::new(172, 16, 0, 1)).is_none());
    }

    fn router(permit_icmp: bool) -> Node {
        let mut config = NodeConfig::new("router", "router_1");
        config.num_ports = Some(2);
        config.ports.insert(
            1,
            PortConfig {
                ip_address: Ipv4Addr::new(192, 168, 1, 1),
                subnet_mask: MASK,
            },
        );
        config.ports.insert(
            2,
            PortConfig {
                ip_address: Ipv4Addr::new(192, 168, 10, 1),
                subnet_mask: MASK,
            },
        );
        let mut node = Node::from_config(&config, &SimConfig::default()).expect("valid router");
        if let Some(acl) = node.kind_mut().acl_mut() {
            acl.add_rule(22, AclRule::permit().src_port(ARP_PORT).dst_port(ARP_PORT));
            if permit_icmp {
                acl.add_rule(23, AclRule::permit().protocol(IpProtocol::Icmp));
            }
        }
        node
    }

    fn host(hostname: &str, ip: [u8; 4], gateway: [u8; 4]) -> Node {
        Node::host(
            hostname,
            NodeKind::Computer,
            ip.into(),
            MASK,
            Some(gateway.into()),
            &SimConfig::default(),
        )
    }

    /// pc_a on router port 1, pc_b on router port 2
    fn run(pc_a: &mut Node, router: &mut Node, pc_b: &mut Node) {
        for _ in 0..32 {
            let mut moved = false;
            for (_, frame) in pc_a.take_outbox() {
                moved = true;
                router.receive_frame(1, frame);
            }
            for (_, frame) in pc_b.take_outbox() {
                moved = true;
                router.receive_frame(2, frame);
            }
            for (port, frame) in router.take_outbox() {
                moved = true;
                match port {
                    1 => pc_a.receive_frame(1, frame),
                    _ => pc_b.receive_frame(1, frame),
                }
            }
            if !moved {
                return;
            }
        }
    }

    fn ping_succeeded(node: &Node, target: Ipv4Addr) -> bool {
        node.software_manager
            .icmp()
            .and_then(|icmp| icmp.ping_record(target))
            .map_or(false, |record| record.all_replied())
    }

    #[test]
    fn test_ping_across_router() {
        let mut router = router(true);
        let mut pc_a = host("pc_a", [192, 168, 1, 10], [192, 168, 1, 1]);
        let mut pc_b = host("pc_b", [192, 168, 10, 10], [192, 168, 10, 1]);
        let target = Ipv4Addr::new(192, 168, 10, 10);

        pc_a.ping(target, PING_COUNT);
        run(&mut pc_a, &mut router, &mut pc_b);
        assert!(ping_succeeded(&pc_a, target));
    }

    #[test]
    fn test_implicit_deny_blocks_icmp_and_logs_it() {
        let mut router = router(false);
        let mut pc_a = host("pc_a", [192, 168, 1, 10], [192, 168, 1, 1]);
        let mut pc_b = host("pc_b", [192, 168, 10, 10], [192, 168, 10, 1]);
        let target = Ipv4Addr::new(192, 168, 10, 10);

        pc_a.ping(target, PING_COUNT);
        run(&mut pc_a, &mut router, &mut pc_b);
        assert!(!ping_succeeded(&pc_a, target));
        assert!(router.context.sys_log.contains("by rule implicit"));
    }
}
