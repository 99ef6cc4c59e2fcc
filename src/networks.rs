//! Prebuilt topologies
//!
//! Each builder assembles a typed [`NetworkConfig`] and hands it to
//! [`Network::from_config`], so the prebuilt networks go through the same
//! validation as user-supplied ones.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::config::{AclRuleConfig, LinkConfig, NetworkConfig, NodeConfig, PortConfig, PortSpec, RouteConfig, SimConfig, SoftwareConfig};
use crate::error::ConfigError;
use crate::network::Network;

const MASK_24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

// ============================================================================
// CONFIG HELPERS
// ============================================================================

fn permit(protocol: Option<&str>, port: Option<&str>) -> AclRuleConfig {
    AclRuleConfig {
        action: "PERMIT".to_string(),
        protocol: protocol.map(str::to_string),
        src_ip: None,
        src_wildcard_mask: None,
        dst_ip: None,
        dst_wildcard_mask: None,
        src_port: port.map(|name| PortSpec::Name(name.to_string())),
        dst_port: port.map(|name| PortSpec::Name(name.to_string())),
    }
}

/// ARP at 22 and ICMP at 23, the minimum a routed network needs
fn base_router_acl() -> BTreeMap<usize, AclRuleConfig> {
    BTreeMap::from([(22, permit(None, Some("ARP"))), (23, permit(Some("ICMP"), None))])
}

fn router(hostname: &str, num_ports: usize, ports: &[(usize, Ipv4Addr)]) -> NodeConfig {
    let mut node = NodeConfig::new("router", hostname);
    node.num_ports = Some(num_ports);
    for (port_num, ip_address) in ports {
        node.ports.insert(
            *port_num,
            PortConfig {
                ip_address: *ip_address,
                subnet_mask: MASK_24,
            },
        );
    }
    node.acl = base_router_acl();
    node
}

fn switch(hostname: &str, num_ports: usize) -> NodeConfig {
    let mut node = NodeConfig::new("switch", hostname);
    node.num_ports = Some(num_ports);
    node
}

fn host(node_type: &str, hostname: &str, ip_address: Ipv4Addr, default_gateway: Ipv4Addr) -> NodeConfig {
    let mut node = NodeConfig::new(node_type, hostname);
    node.ip_address = Some(ip_address);
    node.subnet_mask = Some(MASK_24);
    node.default_gateway = Some(default_gateway);
    node
}

fn link(a: &str, a_port: usize, b: &str, b_port: usize) -> LinkConfig {
    LinkConfig {
        endpoint_a_hostname: a.to_string(),
        endpoint_a_port: a_port,
        endpoint_b_hostname: b.to_string(),
        endpoint_b_port: b_port,
        bandwidth: None,
    }
}

// ============================================================================
// TOPOLOGIES
// ============================================================================

/// client_1 -- switch_2 -- router_1 -- switch_1 -- server_1
pub fn client_server_routed_config() -> NetworkConfig {
    NetworkConfig {
        nodes: vec![
            router(
                "router_1",
                3,
                &[(1, Ipv4Addr::new(192, 168, 1, 1)), (2, Ipv4Addr::new(192, 168, 2, 1))],
            ),
            switch("switch_1", 6),
            switch("switch_2", 6),
            host(
                "computer",
                "client_1",
                Ipv4Addr::new(192, 168, 2, 2),
                Ipv4Addr::new(192, 168, 2, 1),
            ),
            host(
                "server",
                "server_1",
                Ipv4Addr::new(192, 168, 1, 2),
                Ipv4Addr::new(192, 168, 1, 1),
            ),
        ],
        links: vec![
            link("router_1", 1, "switch_1", 6),
            link("router_1", 2, "switch_2", 6),
            link("switch_2", 1, "client_1", 1),
            link("switch_1", 1, "server_1", 1),
        ],
    }
}

pub fn client_server_routed(config: &SimConfig) -> Result<Network, ConfigError> {
    Network::from_config(&client_server_routed_config(), config)
}

pub const UC2_DOMAIN_CONTROLLER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const UC2_WEB_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 12);
pub const UC2_DATABASE_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 14);
pub const UC2_BACKUP_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 16);

/// Two subnets joined by router_1: servers on 192.168.1.0/24 behind
/// switch_1, clients on 192.168.10.0/24 behind switch_2, and a
/// dual-homed security suite on both.
pub fn arcd_uc2_network_config() -> NetworkConfig {
    let server_gateway = Ipv4Addr::new(192, 168, 1, 1);
    let client_gateway = Ipv4Addr::new(192, 168, 10, 1);
    let database_client =
        || SoftwareConfig::new("database-client").with_option("server_ip", UC2_DATABASE_SERVER_IP.to_string());
    let web_browser = || SoftwareConfig::new("web-browser").with_option("target_url", "http://arcd.com/users/");

    let mut router_1 = router(
        "router_1",
        5,
        &[(1, server_gateway), (2, client_gateway)],
    );
    router_1.acl.insert(18, permit(Some("TCP"), Some("HTTP")));
    router_1.acl.insert(19, permit(None, Some("DNS")));
    router_1.acl.insert(20, permit(Some("TCP"), Some("FTP")));
    router_1.acl.insert(21, permit(Some("TCP"), Some("POSTGRES_SERVER")));

    let mut domain_controller = host("server", "domain_controller", UC2_DOMAIN_CONTROLLER_IP, server_gateway);
    domain_controller.services.push(
        SoftwareConfig::new("dns-server")
            .with_option("domain_mapping", serde_json::json!({"arcd.com": UC2_WEB_SERVER_IP.to_string()})),
    );

    let mut web_server = host("server", "web_server", UC2_WEB_SERVER_IP, server_gateway);
    web_server.dns_server = Some(UC2_DOMAIN_CONTROLLER_IP);
    web_server.services.push(SoftwareConfig::new("web-server"));
    web_server.applications.push(database_client());

    let mut database_server = host("server", "database_server", UC2_DATABASE_SERVER_IP, server_gateway);
    database_server.services.push(
        SoftwareConfig::new("database-service").with_option("backup_server_ip", UC2_BACKUP_SERVER_IP.to_string()),
    );

    let mut backup_server = host("server", "backup_server", UC2_BACKUP_SERVER_IP, server_gateway);
    backup_server.services.push(SoftwareConfig::new("ftp-server"));

    let security_suite = host(
        "server",
        "security_suite",
        Ipv4Addr::new(192, 168, 1, 110),
        server_gateway,
    );

    let mut client_1 = host("computer", "client_1", Ipv4Addr::new(192, 168, 10, 21), client_gateway);
    client_1.dns_server = Some(UC2_DOMAIN_CONTROLLER_IP);
    client_1.applications.push(web_browser());
    client_1.applications.push(database_client());
    client_1.applications.push(
        SoftwareConfig::new("data-manipulation-bot")
            .with_option("server_ip", UC2_DATABASE_SERVER_IP.to_string())
            .with_option("payload", "DELETE"),
    );

    let mut client_2 = host("computer", "client_2", Ipv4Addr::new(192, 168, 10, 22), client_gateway);
    client_2.dns_server = Some(UC2_DOMAIN_CONTROLLER_IP);
    client_2.applications.push(web_browser());
    client_2.applications.push(database_client());

    NetworkConfig {
        nodes: vec![
            router_1,
            switch("switch_1", 8),
            switch("switch_2", 8),
            client_1,
            client_2,
            domain_controller,
            web_server,
            database_server,
            backup_server,
            security_suite,
        ],
        links: vec![
            link("router_1", 1, "switch_1", 8),
            link("router_1", 2, "switch_2", 8),
            link("switch_2", 1, "client_1", 1),
            link("switch_2", 2, "client_2", 1),
            link("switch_1", 1, "domain_controller", 1),
            link("switch_1", 2, "web_server", 1),
            link("switch_1", 3, "database_server", 1),
            link("switch_1", 4, "backup_server", 1),
            link("switch_1", 7, "security_suite", 1),
        ],
    }
}

/// The UC2 network, with the security suite's second NIC on the client subnet
pub fn arcd_uc2_network(config: &SimConfig) -> Result<Network, ConfigError> {
    let mut network = Network::from_config(&arcd_uc2_network_config(), config)?;
    if let Some(security_suite) = network.get_node_mut("security_suite") {
        security_suite.add_interface(
            crate::interface::NetworkInterface::new("security_suite", 2, crate::interface::InterfaceKind::Nic, config)
                .with_ip(Ipv4Addr::new(192, 168, 10, 110), MASK_24),
        );
    }
    network.connect("switch_2", 7, "security_suite", 2, None)?;
    Ok(network)
}

/// client -- router_0 -- router_1 -- ... -- router_(n-1) -- server
///
/// Subnet `10.0.i.0/24` sits between router i-1 and router i. Each router
/// has static routes to every subnet it is not attached to and a permissive
/// ACL, so traffic crosses exactly `num_routers` routers.
pub fn router_chain_config(num_routers: usize) -> NetworkConfig {
    let subnet_ip = |subnet: usize, host: u8| Ipv4Addr::new(10, 0, subnet as u8, host);
    let mut nodes = Vec::with_capacity(num_routers + 2);
    let mut links = Vec::with_capacity(num_routers + 1);

    nodes.push(host("computer", "client", subnet_ip(0, 10), subnet_ip(0, 1)));
    for index in 0..num_routers {
        let hostname = format!("router_{}", index);
        let mut node = router(&hostname, 2, &[(1, subnet_ip(index, 1)), (2, subnet_ip(index + 1, 2))]);
        node.acl.insert(24, permit(None, None));
        for subnet in 0..=num_routers {
            if subnet == index || subnet == index + 1 {
                continue;
            }
            let next_hop_ip_address = if subnet < index {
                subnet_ip(index, 2)
            } else {
                subnet_ip(index + 1, 1)
            };
            node.routes.push(RouteConfig {
                address: subnet_ip(subnet, 0),
                subnet_mask: MASK_24,
                next_hop_ip_address,
                metric: 0.0,
            });
        }
        let previous = if index == 0 {
            ("client".to_string(), 1)
        } else {
            (format!("router_{}", index - 1), 2)
        };
        links.push(link(&previous.0, previous.1, &hostname, 1));
        nodes.push(node);
    }
    nodes.push(host(
        "server",
        "server",
        subnet_ip(num_routers, 10),
        subnet_ip(num_routers, 2),
    ));
    let last = if num_routers == 0 {
        ("client".to_string(), 1)
    } else {
        (format!("router_{}", num_routers - 1), 2)
    };
    links.push(link(&last.0, last.1, "server", 1));
    NetworkConfig { nodes, links }
}

pub fn router_chain(num_routers: usize, config: &SimConfig) -> Result<Network, ConfigError> {
    Network::from_config(&router_chain_config(num_routers), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uc2_builds_with_expected_software() {
        let network = arcd_uc2_network(&SimConfig::default()).expect("valid network");
        assert_eq!(network.hostnames().len(), 10);
        let database_server = network.get_node("database_server").expect("present");
        assert!(database_server.software_manager.service_running("database-service"));
        assert!(database_server.software_manager.service("ftp-client").is_some());
        let security_suite = network.get_node("security_suite").expect("present");
        assert_eq!(security_suite.ip_addresses().len(), 2);
    }

    #[test]
    fn test_chain_routes_skip_connected_subnets() {
        let config = router_chain_config(3);
        assert_eq!(config.nodes.len(), 5);
        assert_eq!(config.links.len(), 4);
        let middle = &config.nodes[2];
        assert_eq!(middle.hostname, "router_1");
        let destinations: Vec<Ipv4Addr> = middle.routes.iter().map(|route| route.address).collect();
        assert_eq!(destinations, vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 3, 0)]);
    }
}
