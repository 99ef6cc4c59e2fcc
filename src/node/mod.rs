//! Nodes: hosts and network devices
//!
//! A [`Node`] owns its interfaces, file system, syslog and software. The
//! [`NodeKind`] decides what happens to a frame once an interface has
//! accepted it: hosts hand it to the session layer, switches forward by MAC,
//! routers and firewalls filter through their ACLs and forward by route.
//!
//! Power is time-delayed: `power_on` boots for `start_up_duration` steps,
//! `power_off` shuts down for `shut_down_duration` steps, and `reset` does
//! both in turn. Nothing runs and no frame is accepted unless the node is ON.

pub mod firewall;
pub mod router;
pub mod session;
pub mod switch;

pub use firewall::*;
pub use router::*;
pub use switch::*;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::acl::{AccessControlList, AclAction, AclRule};
use crate::config::{NodeConfig, NodeTimings, SimConfig, SoftwareConfig};
use crate::error::{ConfigError, RequestError};
use crate::frame::Frame;
use crate::interface::{InterfaceKind, NetworkInterface};
use crate::request::{
    arg_parse, arg_str, expect_args, token_to_string, RequestContext, RequestHandler, RequestManager,
    RequestResponse, RequestToken, RequestType, Validator,
};
use crate::software::{NodeContext, RelayedRequest, SoftwareEvent};
use crate::software_manager::SoftwareManager;
use crate::tick_countdown;

/// Echo requests sent by one `ping`
pub const PING_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeOperatingState {
    On = 1,
    Off = 2,
    Booting = 3,
    ShuttingDown = 4,
    Resetting = 5,
}

impl fmt::Display for NodeOperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOperatingState::On => write!(f, "ON"),
            NodeOperatingState::Off => write!(f, "OFF"),
            NodeOperatingState::Booting => write!(f, "BOOTING"),
            NodeOperatingState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            NodeOperatingState::Resetting => write!(f, "RESETTING"),
        }
    }
}

// ============================================================================
// NODE KINDS
// ============================================================================

pub const NODE_TYPE_TAGS: [&str; 6] = ["computer", "server", "switch", "router", "firewall", "wireless-router"];

#[derive(Debug, Clone)]
pub enum NodeKind {
    Computer,
    Server,
    Switch(SwitchState),
    Router(RouterState),
    Firewall(FirewallState),
    WirelessRouter(RouterState),
}

impl NodeKind {
    /// Bare kind for a type tag, with default ACLs and an empty route table
    pub fn from_type_tag(tag: &str, config: &SimConfig) -> Result<Self, ConfigError> {
        let max_acl_rules = config.network.max_acl_rules;
        let kind = match tag {
            "computer" => NodeKind::Computer,
            "server" => NodeKind::Server,
            "switch" => NodeKind::Switch(SwitchState::default()),
            "router" => NodeKind::Router(RouterState::new(max_acl_rules)),
            "firewall" => NodeKind::Firewall(FirewallState::new(max_acl_rules)),
            "wireless-router" => NodeKind::WirelessRouter(RouterState::new(max_acl_rules)),
            other => return Err(ConfigError::UnknownNodeType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeKind::Computer => "computer",
            NodeKind::Server => "server",
            NodeKind::Switch(_) => "switch",
            NodeKind::Router(_) => "router",
            NodeKind::Firewall(_) => "firewall",
            NodeKind::WirelessRouter(_) => "wireless-router",
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, NodeKind::Computer | NodeKind::Server)
    }

    pub fn route_table(&self) -> Option<&RouteTable> {
        match self {
            NodeKind::Router(state) | NodeKind::WirelessRouter(state) => Some(&state.route_table),
            NodeKind::Firewall(state) => Some(&state.route_table),
            _ => None,
        }
    }

    pub fn route_table_mut(&mut self) -> Option<&mut RouteTable> {
        match self {
            NodeKind::Router(state) | NodeKind::WirelessRouter(state) => Some(&mut state.route_table),
            NodeKind::Firewall(state) => Some(&mut state.route_table),
            _ => None,
        }
    }

    /// The router ACL, for routers and wireless routers
    pub fn acl(&self) -> Option<&AccessControlList> {
        match self {
            NodeKind::Router(state) | NodeKind::WirelessRouter(state) => Some(&state.acl),
            _ => None,
        }
    }

    pub fn acl_mut(&mut self) -> Option<&mut AccessControlList> {
        match self {
            NodeKind::Router(state) | NodeKind::WirelessRouter(state) => Some(&mut state.acl),
            _ => None,
        }
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        match self {
            NodeKind::Computer | NodeKind::Server => {}
            NodeKind::Switch(switch) => {
                state.insert("mac_address_table".to_string(), switch.describe_state());
            }
            NodeKind::Router(router) | NodeKind::WirelessRouter(router) => {
                state.insert("acl".to_string(), router.acl.describe_state());
                state.insert("route_table".to_string(), router.route_table.describe_state());
            }
            NodeKind::Firewall(firewall) => firewall.describe_state(state),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_tag())
    }
}

// ============================================================================
// NODE
// ============================================================================

/// A frame held back until its next hop's MAC address is known
#[derive(Debug, Clone)]
pub(crate) struct ParkedFrame {
    next_hop: Ipv4Addr,
    port_num: usize,
    frame: Frame,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub context: NodeContext,
    pub software_manager: SoftwareManager,
    network_interfaces: BTreeMap<usize, NetworkInterface>,
    kind: NodeKind,
    operating_state: NodeOperatingState,
    timings: NodeTimings,
    start_up_countdown: Option<u32>,
    shut_down_countdown: Option<u32>,
    os_scan_countdown: Option<u32>,
    pub default_gateway: Option<Ipv4Addr>,
    default_ttl: u8,
    parked: Vec<ParkedFrame>,
    arp_requested: BTreeSet<Ipv4Addr>,
    outbox: Vec<(usize, Frame)>,
    /// Relayed requests waiting on traffic before they can report
    unsettled_relays: Vec<RelayedRequest>,
    request_manager: RequestManager<Node>,
}

impl Node {
    /// A powered-off node with no interfaces or software
    pub fn new(hostname: &str, kind: NodeKind, config: &SimConfig) -> Self {
        let request_manager = node_request_manager(&kind);
        Self {
            context: NodeContext::new(hostname, config),
            software_manager: SoftwareManager::new(config.software),
            network_interfaces: BTreeMap::new(),
            kind,
            operating_state: NodeOperatingState::Off,
            timings: config.node,
            start_up_countdown: None,
            shut_down_countdown: None,
            os_scan_countdown: None,
            default_gateway: None,
            default_ttl: config.network.default_ttl,
            parked: Vec::new(),
            arp_requested: BTreeSet::new(),
            outbox: Vec::new(),
            unsettled_relays: Vec::new(),
            request_manager,
        }
    }

    /// A running host with one NIC and the system software installed
    pub fn host(
        hostname: &str,
        kind: NodeKind,
        ip_address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        default_gateway: Option<Ipv4Addr>,
        config: &SimConfig,
    ) -> Self {
        let mut node = Self::new(hostname, kind, config);
        node.add_interface(NetworkInterface::new(hostname, 1, InterfaceKind::Nic, config).with_ip(ip_address, subnet_mask));
        node.default_gateway = default_gateway;
        node.power_on_now();
        if let Err(error) = node.install_system_software() {
            node.context
                .sys_log
                .error(format!("Unable to install system software: {}", error));
        }
        node
    }

    /// Build a node from its typed config, resolving the type tag
    pub fn from_config(node_config: &NodeConfig, config: &SimConfig) -> Result<Self, ConfigError> {
        let hostname = node_config.hostname.as_str();
        let kind = NodeKind::from_type_tag(&node_config.node_type, config)?;
        let mut node = Self::new(hostname, kind, config);
        node.default_gateway = node_config.default_gateway;
        node.context.dns_server = node_config.dns_server;

        match &mut node.kind {
            NodeKind::Computer | NodeKind::Server => {
                let (Some(ip_address), Some(subnet_mask)) = (node_config.ip_address, node_config.subnet_mask) else {
                    return Err(ConfigError::InvalidNode {
                        hostname: hostname.to_string(),
                        reason: "hosts need an ip_address and subnet_mask".to_string(),
                    });
                };
                let nic = NetworkInterface::new(hostname, 1, InterfaceKind::Nic, config).with_ip(ip_address, subnet_mask);
                node.network_interfaces.insert(1, nic);
            }
            NodeKind::Switch(_) => {
                for port_num in 1..=node_config.num_ports.unwrap_or(24) {
                    let port = NetworkInterface::new(hostname, port_num, InterfaceKind::SwitchPort, config);
                    node.network_interfaces.insert(port_num, port);
                }
            }
            NodeKind::Router(state) => {
                state.configure(node_config)?;
                for port_num in 1..=node_config.num_ports.unwrap_or(5) {
                    let mut port = NetworkInterface::new(hostname, port_num, InterfaceKind::RouterInterface, config);
                    if let Some(port_config) = node_config.ports.get(&port_num) {
                        port = port.with_ip(port_config.ip_address, port_config.subnet_mask);
                    }
                    node.network_interfaces.insert(port_num, port);
                }
            }
            NodeKind::Firewall(state) => {
                state.configure(node_config)?;
                for zone in FirewallZone::ALL {
                    let port_num = zone.port_num();
                    let mut port = NetworkInterface::new(hostname, port_num, InterfaceKind::RouterInterface, config);
                    if let Some(port_config) = node_config.ports.get(&port_num) {
                        port = port.with_ip(port_config.ip_address, port_config.subnet_mask);
                    }
                    node.network_interfaces.insert(port_num, port);
                }
            }
            NodeKind::WirelessRouter(state) => {
                state.configure(node_config)?;
                let mut access_point =
                    NetworkInterface::new(hostname, 1, InterfaceKind::WirelessAccessPoint, config);
                if let Some(wireless) = node_config.wireless_access_point {
                    access_point = access_point.with_ip(wireless.ip_address, wireless.subnet_mask);
                    access_point.set_frequency(wireless.frequency);
                }
                node.network_interfaces.insert(1, access_point);
                let mut port = NetworkInterface::new(hostname, 2, InterfaceKind::RouterInterface, config);
                if let Some(port_config) = node_config.ports.get(&2) {
                    port = port.with_ip(port_config.ip_address, port_config.subnet_mask);
                }
                node.network_interfaces.insert(2, port);
            }
        }
        node.refresh_ip_addresses();

        if node_config.start_up {
            node.power_on_now();
        }
        for service in &node_config.services {
            node.software_manager.install(&mut node.context, service)?;
        }
        for application in &node_config.applications {
            node.software_manager.install(&mut node.context, application)?;
            if let Some(app) = node.software_manager.application_mut(&application.software_type) {
                app.run(&mut node.context);
            }
        }
        node.install_system_software()?;
        Ok(node)
    }

    /// ARP and ICMP everywhere layer 3 runs; hosts also get a DNS client
    pub fn install_system_software(&mut self) -> Result<(), ConfigError> {
        if matches!(self.kind, NodeKind::Switch(_)) {
            return Ok(());
        }
        let mut system = vec![SoftwareConfig::new("arp"), SoftwareConfig::new("icmp")];
        if self.kind.is_host() {
            let mut dns_client = SoftwareConfig::new("dns-client");
            if let Some(dns_server) = self.context.dns_server {
                dns_client = dns_client.with_option("dns_server", dns_server.to_string());
            }
            system.push(dns_client);
        }
        for software in system {
            if self.software_manager.service(&software.software_type).is_none() {
                self.software_manager.install(&mut self.context, &software)?;
            }
        }
        Ok(())
    }

    pub fn hostname(&self) -> &str {
        &self.context.hostname
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub fn operating_state(&self) -> NodeOperatingState {
        self.operating_state
    }

    pub fn is_on(&self) -> bool {
        self.operating_state == NodeOperatingState::On
    }

    pub fn network_interfaces(&self) -> impl Iterator<Item = &NetworkInterface> {
        self.network_interfaces.values()
    }

    pub fn network_interface(&self, port_num: usize) -> Option<&NetworkInterface> {
        self.network_interfaces.get(&port_num)
    }

    pub fn network_interface_mut(&mut self, port_num: usize) -> Option<&mut NetworkInterface> {
        self.network_interfaces.get_mut(&port_num)
    }

    pub fn add_interface(&mut self, interface: NetworkInterface) {
        self.network_interfaces.insert(interface.port_num, interface);
        self.refresh_ip_addresses();
    }

    pub fn ip_addresses(&self) -> &[Ipv4Addr] {
        &self.context.ip_addresses
    }

    fn refresh_ip_addresses(&mut self) {
        self.context.ip_addresses = self
            .network_interfaces
            .values()
            .filter_map(NetworkInterface::ip_address)
            .collect();
    }

    /// Frames waiting to go out, as (port, frame)
    pub fn take_outbox(&mut self) -> Vec<(usize, Frame)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn power_on(&mut self) -> bool {
        if self.operating_state != NodeOperatingState::Off {
            return false;
        }
        if self.timings.start_up_duration == 0 {
            self.power_on_now();
            return true;
        }
        self.context.sys_log.info("Powering on");
        self.operating_state = NodeOperatingState::Booting;
        self.start_up_countdown = Some(self.timings.start_up_duration);
        true
    }

    /// Skip the boot countdown; used when building a network
    pub fn power_on_now(&mut self) {
        self.operating_state = NodeOperatingState::On;
        self.start_up_countdown = None;
        self.context.operational = true;
        self.context.sys_log.info("Power on");
        self.software_manager.start_up(&mut self.context);
    }

    pub fn power_off(&mut self) -> bool {
        if self.operating_state != NodeOperatingState::On {
            return false;
        }
        self.context.sys_log.info("Powering off");
        self.operating_state = NodeOperatingState::ShuttingDown;
        self.shut_down_countdown = Some(self.timings.shut_down_duration.max(1));
        true
    }

    /// Shut down, then boot again
    pub fn reset(&mut self) -> bool {
        if self.operating_state != NodeOperatingState::On {
            return false;
        }
        self.context.sys_log.info("Resetting");
        self.operating_state = NodeOperatingState::Resetting;
        self.shut_down_countdown = Some(self.timings.shut_down_duration.max(1));
        true
    }

    fn finish_shut_down(&mut self) {
        self.software_manager.shut_down(&mut self.context);
        self.context.operational = false;
        self.os_scan_countdown = None;
        self.parked.clear();
        self.arp_requested.clear();
        self.unsettled_relays.clear();
        self.context.sys_log.info("Power off");
    }

    pub fn os_scan(&mut self) -> bool {
        if !self.is_on() {
            return false;
        }
        self.context.sys_log.info("Scanning operating system");
        self.os_scan_countdown = Some(self.timings.os_scan_duration.max(1));
        true
    }

    /// A frame arriving on `port_num` from a link or the airspace
    pub fn receive_frame(&mut self, port_num: usize, frame: Frame) {
        if !self.is_on() {
            return;
        }
        let timestep = self.context.timestep;
        let Some(interface) = self.network_interfaces.get_mut(&port_num) else {
            return;
        };
        let Some(frame) = interface.receive_frame(frame, timestep, &mut self.context.sys_log) else {
            return;
        };
        match self.kind {
            NodeKind::Computer | NodeKind::Server => self.process_host_frame(port_num, frame),
            NodeKind::Switch(_) => self.switch_frame(port_num, frame),
            NodeKind::Router(_) | NodeKind::WirelessRouter(_) => self.router_frame(port_num, frame),
            NodeKind::Firewall(_) => self.firewall_frame(port_num, frame),
        }
        self.flush_outbound();
    }

    /// The network has nothing left to deliver
    pub fn network_idle(&mut self) {
        if !self.is_on() {
            return;
        }
        self.drop_unresolved();
        let settling = RequestContext::new(self.context.timestep).settling();
        for relayed in std::mem::take(&mut self.unsettled_relays) {
            let response = self
                .handle_request(&mut (), &relayed.request, &settling)
                .unwrap_or_else(|error| RequestResponse::failure().with_reason(error.to_string()));
            self.complete_relay(relayed, response);
        }
        let Node {
            context,
            software_manager,
            ..
        } = self;
        software_manager.network_idle(context);
        self.flush_outbound();
    }

    /// Apply a request software on this node relayed to it
    pub(crate) fn apply_relayed(&mut self, relayed: RelayedRequest) {
        let context = RequestContext::new(self.context.timestep);
        self.context
            .sys_log
            .info(format!("{} relayed request {:?}", relayed.requester, relayed.request));
        let response = match self.handle_request(&mut (), &relayed.request, &context) {
            Ok(response) if response.is_pending() => {
                self.unsettled_relays.push(relayed);
                return;
            }
            Ok(response) => response,
            Err(error) => RequestResponse::failure().with_reason(error.to_string()),
        };
        self.complete_relay(relayed, response);
    }

    fn complete_relay(&mut self, relayed: RelayedRequest, response: RequestResponse) {
        self.context.emit(SoftwareEvent::RelayedRequestCompleted {
            requester: relayed.requester,
            request_id: relayed.request_id,
            response,
        });
    }

    pub fn pre_timestep(&mut self, timestep: u64) {
        self.context.set_timestep(timestep);
        self.context.file_system.pre_timestep(timestep);
        for interface in self.network_interfaces.values_mut() {
            interface.pre_timestep(timestep);
        }
        self.drop_unresolved();
    }

    fn drop_unresolved(&mut self) {
        if !self.parked.is_empty() {
            self.context.sys_log.warning(format!(
                "Dropping {} frame(s) whose next hop never answered ARP",
                self.parked.len()
            ));
            self.parked.clear();
        }
        self.arp_requested.clear();
    }

    pub fn apply_timestep(&mut self, timestep: u64) {
        self.context.set_timestep(timestep);
        match self.operating_state {
            NodeOperatingState::Booting => {
                if tick_countdown(&mut self.start_up_countdown) {
                    self.power_on_now();
                }
            }
            NodeOperatingState::ShuttingDown => {
                if tick_countdown(&mut self.shut_down_countdown) {
                    self.finish_shut_down();
                    self.operating_state = NodeOperatingState::Off;
                }
            }
            NodeOperatingState::Resetting => {
                if tick_countdown(&mut self.shut_down_countdown) {
                    self.finish_shut_down();
                    self.operating_state = NodeOperatingState::Off;
                    self.power_on();
                }
            }
            NodeOperatingState::On | NodeOperatingState::Off => {}
        }
        if !self.is_on() {
            return;
        }
        if tick_countdown(&mut self.os_scan_countdown) {
            let Node {
                context,
                software_manager,
                ..
            } = self;
            context.file_system.scan(&mut context.sys_log, true);
            software_manager.scan_all(context);
            context.sys_log.info("Operating system scan complete");
        }
        self.context.file_system.apply_timestep(&mut self.context.sys_log, timestep);
        self.software_manager.apply_timestep(&mut self.context);
        self.flush_outbound();
    }

    pub fn describe_state(&self) -> Value {
        let interfaces: Map<String, Value> = self
            .network_interfaces
            .iter()
            .map(|(port_num, interface)| (port_num.to_string(), interface.describe_state()))
            .collect();
        let software = self.software_manager.describe_state();
        let mut state = Map::new();
        state.insert("hostname".to_string(), json!(self.context.hostname));
        state.insert("type".to_string(), json!(self.kind.type_tag()));
        state.insert("operating_state".to_string(), json!(self.operating_state as u8));
        state.insert("network_interfaces".to_string(), Value::Object(interfaces));
        state.insert("file_system".to_string(), self.context.file_system.describe_state());
        state.insert("services".to_string(), software["services"].clone());
        state.insert("applications".to_string(), software["applications"].clone());
        self.kind.describe_state(&mut state);
        Value::Object(state)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.context.hostname, self.kind, self.operating_state)
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

impl RequestHandler for Node {
    fn request_manager(&self) -> &RequestManager<Self> {
        &self.request_manager
    }
}

fn node_is_on(node: &Node, _: &(), _: &[RequestToken], _: &RequestContext) -> bool {
    node.is_on()
}

fn node_is_off(node: &Node, _: &(), _: &[RequestToken], _: &RequestContext) -> bool {
    node.operating_state == NodeOperatingState::Off
}

fn node_request_manager(kind: &NodeKind) -> RequestManager<Node> {
    fn startup(node: &mut Node, _: &mut (), _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(node.power_on()))
    }
    fn shutdown(node: &mut Node, _: &mut (), _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(node.power_off()))
    }
    fn reset(node: &mut Node, _: &mut (), _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(node.reset()))
    }

    fn os(node: &mut Node, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "os")?;
        match arg_str(request, 0, "os", "action")?.as_str() {
            "scan" => Ok(RequestResponse::from_bool(node.os_scan())),
            other => Err(RequestError::UnknownRequest {
                token: other.to_string(),
                available: "scan".to_string(),
            }),
        }
    }
    fn descend_os(node: &Node, _: &(), request: &[RequestToken], _: &RequestContext) -> bool {
        node.is_on() && request.first().and_then(token_to_string).as_deref() == Some("scan")
    }

    fn ping(node: &mut Node, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "ping")?;
        let target: Ipv4Addr = arg_parse(request, 0, "ping", "target_ip_address")?;
        let started = node.ping(target, PING_COUNT);
        node.flush_outbound();
        Ok(crate::services::pending_if(started))
    }
    fn ping_settled(node: &mut Node, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let target: Ipv4Addr = arg_parse(request, 0, "ping", "target_ip_address")?;
        let record = node.software_manager.icmp().and_then(|icmp| icmp.ping_record(target));
        Ok(RequestResponse::from_bool(record.map_or(false, |record| record.all_replied())))
    }

    fn network_interface(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let port_num: usize = arg_parse(request, 0, "network_interface", "port_num")?;
        let Node {
            context: node_context,
            network_interfaces,
            ..
        } = node;
        match network_interfaces.get_mut(&port_num) {
            Some(interface) => interface.handle_request(&mut node_context.sys_log, &request[1..], context),
            None => Ok(RequestResponse::failure().with_reason(format!("no network interface {}", port_num))),
        }
    }
    fn descend_network_interface(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        let Some(port_num) = request.first().and_then(token_to_string).and_then(|raw| raw.parse::<usize>().ok()) else {
            return false;
        };
        node.network_interfaces
            .get(&port_num)
            .map_or(false, |interface| interface.check_valid(&node.context.sys_log, &request[1..], context))
    }

    fn file_system(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let NodeContext {
            file_system, sys_log, ..
        } = &mut node.context;
        file_system.handle_request(sys_log, request, context)
    }
    fn descend_file_system(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        node.context
            .file_system
            .check_valid(&node.context.sys_log, request, context)
    }

    fn service(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let name = arg_str(request, 0, "service", "service_name")?;
        let Node {
            context: node_context,
            software_manager,
            ..
        } = node;
        let response = match software_manager.service_mut(&name) {
            Some(service) => service.handle_request(node_context, &request[1..], context)?,
            None => RequestResponse::failure().with_reason(format!("service {} is not installed", name)),
        };
        node.flush_outbound();
        Ok(response)
    }
    fn descend_service(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        request
            .first()
            .and_then(token_to_string)
            .and_then(|name| node.software_manager.service(&name))
            .map_or(false, |service| service.check_valid(&node.context, &request[1..], context))
    }

    fn application(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        let name = arg_str(request, 0, "application", "application_name")?;
        let Node {
            context: node_context,
            software_manager,
            ..
        } = node;
        let response = match software_manager.application_mut(&name) {
            Some(application) => application.handle_request(node_context, &request[1..], context)?,
            None => RequestResponse::failure().with_reason(format!("application {} is not installed", name)),
        };
        node.flush_outbound();
        Ok(response)
    }
    fn descend_application(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        request
            .first()
            .and_then(token_to_string)
            .and_then(|name| node.software_manager.application(&name))
            .map_or(false, |application| application.check_valid(&node.context, &request[1..], context))
    }

    // install <type> [options] | uninstall <name>
    fn software_manager(node: &mut Node, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let action = arg_str(request, 0, "software_manager", "action")?;
        let name = arg_str(request, 1, "software_manager", "software_type")?;
        let Node {
            context,
            software_manager,
            ..
        } = node;
        let done = match action.as_str() {
            "install" => {
                let software = SoftwareConfig {
                    options: crate::request::options(request),
                    ..SoftwareConfig::new(&name)
                };
                match software_manager.install(context, &software) {
                    Ok(installed) => installed,
                    Err(error) => {
                        context.sys_log.error(format!("Cannot install {}: {}", name, error));
                        false
                    }
                }
            }
            "uninstall" => software_manager.uninstall(context, &name),
            other => {
                return Err(RequestError::UnknownRequest {
                    token: other.to_string(),
                    available: "install, uninstall".to_string(),
                })
            }
        };
        Ok(RequestResponse::from_bool(done))
    }
    fn descend_software_manager(node: &Node, _: &(), request: &[RequestToken], _: &RequestContext) -> bool {
        node.is_on()
            && matches!(
                request.first().and_then(token_to_string).as_deref(),
                Some("install") | Some("uninstall")
            )
    }

    fn acl(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        match node.kind.acl_mut() {
            Some(acl) => acl.handle_request(&mut (), request, context),
            None => Ok(RequestResponse::failure().with_reason("node has no ACL")),
        }
    }
    fn descend_acl(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        node.kind
            .acl()
            .map_or(false, |acl| acl.check_valid(&(), request, context))
    }

    fn internal(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        firewall::firewall_zone_request(node, FirewallZone::Internal, request, context)
    }
    fn external(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        firewall::firewall_zone_request(node, FirewallZone::External, request, context)
    }
    fn dmz(node: &mut Node, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        firewall::firewall_zone_request(node, FirewallZone::Dmz, request, context)
    }
    fn descend_zone(node: &Node, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        // zone token already consumed; any zone ACL accepts the same requests
        match &node.kind {
            NodeKind::Firewall(firewall) => firewall.check_valid(FirewallZone::Internal, request, context),
            _ => false,
        }
    }

    let on = || Validator::new(node_is_on, "Cannot perform request on a node that is not powered on.");

    let manager = RequestManager::new()
        .with(
            "startup",
            RequestType::new(startup).with_validator(Validator::new(node_is_off, "Cannot start a node that is not off.")),
        )
        .with("shutdown", RequestType::new(shutdown).with_validator(on()))
        .with("reset", RequestType::new(reset).with_validator(on()))
        .with("os", RequestType::route(os, descend_os).with_validator(on()))
        .with("ping", RequestType::new(ping).with_validator(on()).with_settle(ping_settled))
        .with("network_interface", RequestType::route(network_interface, descend_network_interface))
        .with("file_system", RequestType::route(file_system, descend_file_system).with_validator(on()))
        .with("service", RequestType::route(service, descend_service).with_validator(on()))
        .with("application", RequestType::route(application, descend_application).with_validator(on()))
        .with(
            "software_manager",
            RequestType::route(software_manager, descend_software_manager).with_validator(on()),
        );

    match kind {
        NodeKind::Router(_) | NodeKind::WirelessRouter(_) => manager.with("acl", RequestType::route(acl, descend_acl)),
        NodeKind::Firewall(_) => manager
            .with("internal", RequestType::route(internal, descend_zone))
            .with("external", RequestType::route(external, descend_zone))
            .with("dmz", RequestType::route(dmz, descend_zone)),
        _ => manager,
    }
}

/// Default ACL for a router-style device
pub(crate) fn router_acl(name: &str, implicit_action: AclAction, max_acl_rules: usize) -> AccessControlList {
    AccessControlList::new(name, implicit_action, max_acl_rules)
}

/// Load `(position -> rule)` entries into `acl`
pub(crate) fn load_acl_rules(
    acl: &mut AccessControlList,
    rules: &BTreeMap<usize, crate::config::AclRuleConfig>,
) -> Result<(), ConfigError> {
    for (position, rule_config) in rules {
        let rule = AclRule::from_config(rule_config)?;
        if !acl.add_rule(*position, rule) {
            return Err(ConfigError::Invalid(format!(
                "{}: rule position {} is outside the ACL",
                acl.name, position
            )));
        }
    }
    Ok(())
}
