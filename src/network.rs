//! The network container
//!
//! Owns every node and every link. Frames leave nodes through their outboxes
//! and are carried here: over the link cabled to the sending port, or through
//! the airspace for wireless interfaces. Delivery is FIFO and runs until no
//! node has anything left to send, bounded by `max_deliveries_per_flush`.

use std::collections::{BTreeMap, VecDeque};

use serde_json::{json, Map, Value};

use crate::config::{NetworkConfig, NetworkSettings, SimConfig};
use crate::error::{ConfigError, RequestError};
use crate::frame::Frame;
use crate::node::Node;
use crate::request::{
    token_to_string, RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken, RequestType,
    Validator,
};

/// Idle notifications per flush; each may wake software that sends again
const MAX_IDLE_ROUNDS: usize = 4;

// ============================================================================
// LINKS
// ============================================================================

/// One end of a link
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port_num: usize,
}

impl Endpoint {
    pub fn new(hostname: &str, port_num: usize) -> Self {
        Self {
            hostname: hostname.to_string(),
            port_num,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port_num)
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub endpoint_a: Endpoint,
    pub endpoint_b: Endpoint,
    /// Mbit per timestep
    pub bandwidth: f64,
    current_load: f64,
}

impl Link {
    pub fn new(endpoint_a: Endpoint, endpoint_b: Endpoint, bandwidth: f64) -> Self {
        Self {
            endpoint_a,
            endpoint_b,
            bandwidth,
            current_load: 0.0,
        }
    }

    pub fn current_load(&self) -> f64 {
        self.current_load
    }

    pub fn utilisation(&self) -> f64 {
        if self.bandwidth <= 0.0 {
            return 0.0;
        }
        self.current_load / self.bandwidth
    }

    /// 0 when idle, otherwise 1..=bins by share of bandwidth used this step
    pub fn utilisation_level(&self, bins: u32) -> u32 {
        if self.current_load <= 0.0 || bins == 0 {
            return 0;
        }
        let level = (self.utilisation() * f64::from(bins)).ceil() as u32;
        level.clamp(1, bins)
    }

    fn can_carry(&self, frame: &Frame) -> bool {
        self.current_load + frame.size_mbits() <= self.bandwidth
    }

    fn other_end(&self, from: &Endpoint) -> &Endpoint {
        if *from == self.endpoint_a {
            &self.endpoint_b
        } else {
            &self.endpoint_a
        }
    }

    fn name(&self) -> String {
        format!("{}<->{}", self.endpoint_a, self.endpoint_b)
    }

    pub fn pre_timestep(&mut self) {
        self.current_load = 0.0;
    }

    pub fn describe_state(&self) -> Value {
        json!({
            "endpoint_a": self.endpoint_a.to_string(),
            "endpoint_b": self.endpoint_b.to_string(),
            "bandwidth": self.bandwidth,
            "current_load": self.current_load,
        })
    }
}

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Debug, Clone)]
pub struct Network {
    nodes: BTreeMap<String, Node>,
    links: Vec<Link>,
    link_index: BTreeMap<Endpoint, usize>,
    settings: NetworkSettings,
    request_manager: RequestManager<Network>,
}

impl Network {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            nodes: BTreeMap::new(),
            links: Vec::new(),
            link_index: BTreeMap::new(),
            settings: config.network.clone(),
            request_manager: network_request_manager(),
        }
    }

    /// Build every node, then cable the links
    pub fn from_config(network_config: &NetworkConfig, config: &SimConfig) -> Result<Self, ConfigError> {
        let mut network = Self::new(config);
        for node_config in &network_config.nodes {
            network.add_node(Node::from_config(node_config, config)?)?;
        }
        for link in &network_config.links {
            network.connect(
                &link.endpoint_a_hostname,
                link.endpoint_a_port,
                &link.endpoint_b_hostname,
                link.endpoint_b_port,
                link.bandwidth,
            )?;
        }
        log::info!(
            "Built network with {} nodes and {} links",
            network.nodes.len(),
            network.links.len()
        );
        Ok(network)
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), ConfigError> {
        let hostname = node.hostname().to_string();
        if self.nodes.contains_key(&hostname) {
            return Err(ConfigError::DuplicateHostname(hostname));
        }
        log::debug!("Added node {}", node);
        self.nodes.insert(hostname, node);
        Ok(())
    }

    /// Cable two ports together; returns the link's index
    pub fn connect(
        &mut self,
        hostname_a: &str,
        port_a: usize,
        hostname_b: &str,
        port_b: usize,
        bandwidth: Option<f64>,
    ) -> Result<usize, ConfigError> {
        let endpoint_a = self.free_endpoint(hostname_a, port_a)?;
        let endpoint_b = self.free_endpoint(hostname_b, port_b)?;
        if endpoint_a == endpoint_b {
            return Err(ConfigError::PortInUse {
                hostname: hostname_a.to_string(),
                port: port_a,
            });
        }
        let index = self.links.len();
        let link = Link::new(
            endpoint_a.clone(),
            endpoint_b.clone(),
            bandwidth.unwrap_or(self.settings.default_bandwidth),
        );
        log::debug!("Connected {}", link.name());
        self.links.push(link);
        self.link_index.insert(endpoint_a, index);
        self.link_index.insert(endpoint_b, index);
        Ok(index)
    }

    fn free_endpoint(&self, hostname: &str, port_num: usize) -> Result<Endpoint, ConfigError> {
        let node = self
            .nodes
            .get(hostname)
            .ok_or_else(|| ConfigError::UnknownNode(hostname.to_string()))?;
        if node.network_interface(port_num).is_none() {
            return Err(ConfigError::UnknownPort {
                hostname: hostname.to_string(),
                port: port_num,
            });
        }
        let endpoint = Endpoint::new(hostname, port_num);
        if self.link_index.contains_key(&endpoint) {
            return Err(ConfigError::PortInUse {
                hostname: hostname.to_string(),
                port: port_num,
            });
        }
        Ok(endpoint)
    }

    pub fn get_node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    pub fn get_node_mut(&mut self, hostname: &str) -> Option<&mut Node> {
        self.nodes.get_mut(hostname)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link_at(&self, hostname: &str, port_num: usize) -> Option<&Link> {
        self.link_index
            .get(&Endpoint::new(hostname, port_num))
            .and_then(|index| self.links.get(*index))
    }

    fn interface_enabled(&self, endpoint: &Endpoint) -> bool {
        self.nodes
            .get(&endpoint.hostname)
            .and_then(|node| node.network_interface(endpoint.port_num))
            .map_or(false, |interface| interface.is_enabled())
    }

    /// A link is up while both of its interfaces are enabled
    pub fn link_is_up(&self, link: &Link) -> bool {
        self.interface_enabled(&link.endpoint_a) && self.interface_enabled(&link.endpoint_b)
    }

    fn collect_outboxes(&mut self, queue: &mut VecDeque<(Endpoint, Frame)>) {
        for (hostname, node) in self.nodes.iter_mut() {
            for (port_num, frame) in node.take_outbox() {
                queue.push_back((Endpoint::new(hostname, port_num), frame));
            }
        }
    }

    /// Where a frame sent from `from` arrives
    fn destinations(&mut self, from: &Endpoint, frame: &Frame) -> Vec<Endpoint> {
        if let Some(&index) = self.link_index.get(from) {
            let Some(link) = self.links.get(index) else {
                return Vec::new();
            };
            if !self.link_is_up(link) {
                return Vec::new();
            }
            if !link.can_carry(frame) {
                log::warn!("Link {} is at capacity, frame dropped", link.name());
                return Vec::new();
            }
            let to = link.other_end(from).clone();
            if let Some(link) = self.links.get_mut(index) {
                link.current_load += frame.size_mbits();
            }
            return vec![to];
        }
        self.airspace_destinations(from)
    }

    /// Every other enabled wireless interface on the sender's frequency
    fn airspace_destinations(&self, from: &Endpoint) -> Vec<Endpoint> {
        let Some(frequency) = self
            .nodes
            .get(&from.hostname)
            .and_then(|node| node.network_interface(from.port_num))
            .and_then(|interface| interface.frequency())
        else {
            return Vec::new();
        };
        let mut destinations = Vec::new();
        for (hostname, node) in &self.nodes {
            for interface in node.network_interfaces() {
                let endpoint = Endpoint::new(hostname, interface.port_num);
                if endpoint != *from && interface.is_enabled() && interface.frequency() == Some(frequency) {
                    destinations.push(endpoint);
                }
            }
        }
        destinations
    }

    /// Deliver queued frames until the network is quiet; returns the delivery count
    ///
    /// Once nothing is left in flight every node is told the network is idle,
    /// so software can fail requests whose replies were dropped. Anything that
    /// sends is delivered before the next idle round.
    pub fn flush(&mut self) -> usize {
        let mut queue = VecDeque::new();
        let mut delivered = 0;
        self.collect_outboxes(&mut queue);
        for _ in 0..=MAX_IDLE_ROUNDS {
            while let Some((from, frame)) = queue.pop_front() {
                for to in self.destinations(&from, &frame) {
                    if delivered >= self.settings.max_deliveries_per_flush {
                        log::error!(
                            "Delivery limit of {} frames reached, dropping {} queued frame(s)",
                            self.settings.max_deliveries_per_flush,
                            queue.len() + 1
                        );
                        for node in self.nodes.values_mut() {
                            node.take_outbox();
                        }
                        return delivered;
                    }
                    delivered += 1;
                    if let Some(node) = self.nodes.get_mut(&to.hostname) {
                        node.receive_frame(to.port_num, frame.clone());
                    }
                }
                if queue.is_empty() {
                    self.collect_outboxes(&mut queue);
                }
            }
            for node in self.nodes.values_mut() {
                node.network_idle();
            }
            self.collect_outboxes(&mut queue);
            if queue.is_empty() {
                break;
            }
        }
        delivered
    }

    pub fn pre_timestep(&mut self, timestep: u64) {
        for node in self.nodes.values_mut() {
            node.pre_timestep(timestep);
        }
        for link in &mut self.links {
            link.pre_timestep();
        }
    }

    pub fn apply_timestep(&mut self, timestep: u64) {
        for node in self.nodes.values_mut() {
            node.apply_timestep(timestep);
        }
        self.flush();
    }

    pub fn describe_state(&self) -> Value {
        let nodes: Map<String, Value> = self
            .nodes
            .iter()
            .map(|(hostname, node)| (hostname.clone(), node.describe_state()))
            .collect();
        let links: Map<String, Value> = self
            .links
            .iter()
            .map(|link| {
                let mut state = link.describe_state();
                state["up"] = Value::from(self.link_is_up(link));
                (link.name(), state)
            })
            .collect();
        json!({"nodes": nodes, "links": links})
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

impl RequestHandler for Network {
    fn request_manager(&self) -> &RequestManager<Self> {
        &self.request_manager
    }
}

fn node_exists(network: &Network, _: &(), request: &[RequestToken], _: &RequestContext) -> bool {
    request
        .first()
        .and_then(token_to_string)
        .map_or(false, |hostname| network.nodes.contains_key(&hostname))
}

fn network_request_manager() -> RequestManager<Network> {
    fn node(network: &mut Network, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let hostname = request.first().and_then(token_to_string).ok_or(RequestError::MissingArgument {
            request: "node",
            argument: "hostname",
        })?;
        match network.nodes.get_mut(&hostname) {
            Some(node) => node.handle_request(&mut (), &request[1..], context),
            None => Ok(RequestResponse::unreachable()),
        }
    }
    fn descend_node(network: &Network, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        request
            .first()
            .and_then(token_to_string)
            .and_then(|hostname| network.nodes.get(&hostname))
            .map_or(false, |node| node.check_valid(&(), &request[1..], context))
    }

    RequestManager::new().with(
        "node",
        RequestType::route(node, descend_node)
            .with_validator(Validator::new(node_exists, "Cannot perform request on a node that does not exist.")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, WirelessConfig};
    use crate::interface::AirSpaceFrequency;
    use crate::node::{NodeKind, PING_COUNT};
    use crate::request;
    use std::net::Ipv4Addr;

    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn host(hostname: &str, last_octet: u8, config: &SimConfig) -> Node {
        Node::host(
            hostname,
            NodeKind::Computer,
            Ipv4Addr::new(192, 168, 1, last_octet),
            MASK,
            None,
            config,
        )
    }

    fn switched(config: &SimConfig) -> Network {
        let mut network = Network::new(config);
        let mut switch = NodeConfig::new("switch", "switch_1");
        switch.num_ports = Some(4);
        network
            .add_node(Node::from_config(&switch, config).expect("switch"))
            .expect("unique");
        network.add_node(host("pc_a", 10, config)).expect("unique");
        network.add_node(host("pc_b", 20, config)).expect("unique");
        network.connect("pc_a", 1, "switch_1", 1, None).expect("free ports");
        network.connect("pc_b", 1, "switch_1", 2, None).expect("free ports");
        network
    }

    fn ping(network: &mut Network, from: &str, target: Ipv4Addr) -> bool {
        if let Some(node) = network.get_node_mut(from) {
            node.ping(target, PING_COUNT);
        }
        network.flush();
        network
            .get_node(from)
            .and_then(|node| node.software_manager.icmp())
            .and_then(|icmp| icmp.ping_record(target))
            .map_or(false, |record| record.all_replied())
    }

    #[test]
    fn test_connect_rejects_bad_endpoints() {
        let config = SimConfig::default();
        let mut network = switched(&config);
        assert!(matches!(
            network.connect("pc_a", 1, "switch_1", 3, None),
            Err(ConfigError::PortInUse { .. })
        ));
        assert!(matches!(
            network.connect("pc_c", 1, "switch_1", 3, None),
            Err(ConfigError::UnknownNode(_))
        ));
        assert!(matches!(
            network.connect("switch_1", 9, "switch_1", 3, None),
            Err(ConfigError::UnknownPort { .. })
        ));
        assert!(matches!(network.add_node(host("pc_a", 30, &config)), Err(ConfigError::DuplicateHostname(_))));
    }

    #[test]
    fn test_ping_through_switch_and_link_load() {
        let config = SimConfig::default();
        let mut network = switched(&config);
        assert!(ping(&mut network, "pc_a", Ipv4Addr::new(192, 168, 1, 20)));
        let link = network.link_at("pc_a", 1).expect("cabled");
        assert!(link.current_load() > 0.0);
        assert_eq!(link.utilisation_level(10), 1);

        network.pre_timestep(1);
        let link = network.link_at("pc_a", 1).expect("cabled");
        assert_eq!(link.utilisation_level(10), 0);
    }

    #[test]
    fn test_disabled_endpoint_takes_link_down() {
        let config = SimConfig::default();
        let mut network = switched(&config);
        let context = RequestContext::new(0);
        let response = network
            .handle_request(&mut (), &request!["node", "switch_1", "network_interface", 2, "disable"], &context)
            .expect("routed");
        assert!(response.is_success());
        let link = network.link_at("pc_b", 1).expect("cabled");
        assert!(!network.link_is_up(link));
        assert!(!ping(&mut network, "pc_a", Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[test]
    fn test_unknown_node_fails_validation() {
        let config = SimConfig::default();
        let mut network = switched(&config);
        let context = RequestContext::new(0);
        let request = request!["node", "pc_z", "startup"];
        assert!(!network.check_valid(&(), &request, &context));
        let response = network.handle_request(&mut (), &request, &context).expect("routed");
        assert!(!response.is_success());
    }

    #[test]
    fn test_airspace_joins_wireless_routers() {
        let config = SimConfig::default();
        let mut network = Network::new(&config);
        for (hostname, last_octet) in [("wireless_1", 1), ("wireless_2", 2)] {
            let mut router = NodeConfig::new("wireless-router", hostname);
            router.wireless_access_point = Some(WirelessConfig {
                ip_address: Ipv4Addr::new(192, 168, 1, last_octet),
                subnet_mask: MASK,
                frequency: AirSpaceFrequency::Wifi2_4,
            });
            let mut node = Node::from_config(&router, &config).expect("wireless router");
            if let Some(acl) = node.kind_mut().acl_mut() {
                acl.implicit_action = crate::acl::AclAction::Permit;
            }
            network.add_node(node).expect("unique");
        }
        assert!(ping(&mut network, "wireless_1", Ipv4Addr::new(192, 168, 1, 2)));
    }
}
