//! Session configuration
//!
//! [`SimConfig`] is created once per session and handed by reference to every
//! constructor that needs a duration, capacity or keyword list. The typed
//! network description ([`NetworkConfig`]) is what an external loader produces;
//! type tags inside it are resolved by the static factories on `NodeKind`,
//! `ServiceKind` and `ApplicationKind`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::interface::AirSpaceFrequency;

// ============================================================================
// SESSION SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub file_system: FileSystemTimings,
    pub software: SoftwareTimings,
    pub node: NodeTimings,
    pub nmne: NmneConfig,
    pub network: NetworkSettings,
    pub logging: LogSettings,
    pub game: GameSettings,
}

impl SimConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Countdown lengths for folder and file processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemTimings {
    pub scan_duration: u32,
    pub restore_duration: u32,
    pub red_scan_duration: u32,
}

impl Default for FileSystemTimings {
    fn default() -> Self {
        Self {
            scan_duration: 3,
            restore_duration: 3,
            red_scan_duration: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareTimings {
    /// Timesteps a service spends in RESTARTING
    pub restart_duration: u32,
    /// Timesteps software spends in FIXING
    pub fixing_duration: u32,
}

impl Default for SoftwareTimings {
    fn default() -> Self {
        Self {
            restart_duration: 5,
            fixing_duration: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTimings {
    pub start_up_duration: u32,
    pub shut_down_duration: u32,
    /// Timesteps an OS scan takes before visible states are refreshed
    pub os_scan_duration: u32,
}

impl Default for NodeTimings {
    fn default() -> Self {
        Self {
            start_up_duration: 3,
            shut_down_duration: 3,
            os_scan_duration: 10,
        }
    }
}

/// Malicious network event capture settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmneConfig {
    pub capture_nmne: bool,
    pub nmne_capture_keywords: Vec<String>,
}

impl Default for NmneConfig {
    fn default() -> Self {
        Self {
            capture_nmne: true,
            nmne_capture_keywords: vec!["DELETE".to_string(), "ENCRYPT".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub default_ttl: u8,
    /// Link capacity in Mbit per timestep
    pub default_bandwidth: f64,
    /// Upper bound on frame deliveries in one flush, guards against broadcast storms
    pub max_deliveries_per_flush: usize,
    pub max_acl_rules: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            default_ttl: 64,
            default_bandwidth: 100.0,
            max_deliveries_per_flush: 10_000,
            max_acl_rules: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub sys_log_capacity: usize,
    pub pcap_capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            sys_log_capacity: 1_000,
            pcap_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub max_episode_length: u64,
    pub seed: u64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            max_episode_length: 256,
            seed: 0,
        }
    }
}

// ============================================================================
// TYPED NETWORK DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

impl NetworkConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Type tag, e.g. "computer", "server", "switch", "router"
    #[serde(rename = "type")]
    pub node_type: String,
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub default_gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub num_ports: Option<usize>,
    /// Layer-3 port settings for routers and firewalls
    #[serde(default)]
    pub ports: BTreeMap<usize, PortConfig>,
    /// Router ACL, keyed by rule position
    #[serde(default)]
    pub acl: BTreeMap<usize, AclRuleConfig>,
    /// Firewall ACLs keyed by list name (e.g. "internal_inbound"), then position
    #[serde(default)]
    pub zone_acls: BTreeMap<String, BTreeMap<usize, AclRuleConfig>>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub default_route: Option<Ipv4Addr>,
    #[serde(default)]
    pub wireless_access_point: Option<WirelessConfig>,
    #[serde(default)]
    pub services: Vec<SoftwareConfig>,
    #[serde(default)]
    pub applications: Vec<SoftwareConfig>,
    #[serde(default = "default_true")]
    pub start_up: bool,
}

impl NodeConfig {
    pub fn new(node_type: &str, hostname: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            hostname: hostname.to_string(),
            ip_address: None,
            subnet_mask: None,
            default_gateway: None,
            dns_server: None,
            num_ports: None,
            ports: BTreeMap::new(),
            acl: BTreeMap::new(),
            zone_acls: BTreeMap::new(),
            routes: Vec::new(),
            default_route: None,
            wireless_access_point: None,
            services: Vec::new(),
            applications: Vec::new(),
            start_up: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessConfig {
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    #[serde(default)]
    pub frequency: AirSpaceFrequency,
}

/// A port given either by number or by well-known name ("HTTP", "ALL")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRuleConfig {
    pub action: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub src_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub src_wildcard_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub dst_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub dst_wildcard_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub src_port: Option<PortSpec>,
    #[serde(default)]
    pub dst_port: Option<PortSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub next_hop_ip_address: Ipv4Addr,
    #[serde(default)]
    pub metric: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareConfig {
    /// Type tag, e.g. "web-server", "database-client"
    #[serde(rename = "type")]
    pub software_type: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub listen_on_ports: Vec<u16>,
}

impl SoftwareConfig {
    pub fn new(software_type: &str) -> Self {
        Self {
            software_type: software_type.to_string(),
            options: Map::new(),
            listen_on_ports: Vec::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub endpoint_a_hostname: String,
    pub endpoint_a_port: usize,
    pub endpoint_b_hostname: String,
    pub endpoint_b_port: usize,
    #[serde(default)]
    pub bandwidth: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_durations() {
        let config = SimConfig::default();
        assert_eq!(config.file_system.scan_duration, 3);
        assert_eq!(config.software.restart_duration, 5);
        assert_eq!(config.game.max_episode_length, 256);
        assert_eq!(config.nmne.nmne_capture_keywords, vec!["DELETE", "ENCRYPT"]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SimConfig::from_json_str(r#"{"software": {"restart_duration": 2}, "game": {"seed": 7}}"#)
            .expect("valid config");
        assert_eq!(config.software.restart_duration, 2);
        assert_eq!(config.software.fixing_duration, 2);
        assert_eq!(config.game.seed, 7);
        assert_eq!(config.network.default_ttl, 64);
    }

    #[test]
    fn test_network_config_parses_type_tags_and_ports() {
        let text = r#"{
            "nodes": [
                {"type": "router", "hostname": "router_1", "num_ports": 2,
                 "ports": {"1": {"ip_address": "192.168.1.1", "subnet_mask": "255.255.255.0"}},
                 "acl": {"22": {"action": "PERMIT", "src_port": "ARP", "dst_port": 219}}},
                {"type": "computer", "hostname": "client_1", "ip_address": "192.168.1.2",
                 "subnet_mask": "255.255.255.0",
                 "applications": [{"type": "web-browser", "options": {"target_url": "http://arcd.com/"}}]}
            ],
            "links": [{"endpoint_a_hostname": "router_1", "endpoint_a_port": 1,
                       "endpoint_b_hostname": "client_1", "endpoint_b_port": 1}]
        }"#;
        let config = NetworkConfig::from_json_str(text).expect("valid network");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].acl[&22].src_port, Some(PortSpec::Name("ARP".to_string())));
        assert_eq!(config.nodes[0].acl[&22].dst_port, Some(PortSpec::Number(219)));
        assert_eq!(config.nodes[1].applications[0].software_type, "web-browser");
        assert!(config.nodes[1].start_up);
        assert_eq!(config.links[0].bandwidth, None);
    }
}
