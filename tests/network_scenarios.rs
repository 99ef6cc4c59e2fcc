//! End-to-end traffic through the prebuilt topologies: ACL changes made by
//! request, TTL accounting across routers, interface disabling and recovery.

use netsec_sim::applications::{ApplicationKind, DataManipulationAttackStage};
use netsec_sim::frame::IpProtocol;
use netsec_sim::networks::{arcd_uc2_network, client_server_routed, router_chain};
use netsec_sim::{request, Request, RequestContext, RequestResponse, SimConfig, Simulation};

fn apply(sim: &mut Simulation, request: Request) -> RequestResponse {
    let context = RequestContext::new(sim.timestep());
    sim.apply_request(&request, &context).expect("well-formed request")
}

fn ping(sim: &mut Simulation, hostname: &str, target: &str) -> bool {
    apply(sim, request!["network", "node", hostname, "ping", target]).is_success()
}

fn routed() -> Simulation {
    let config = SimConfig::default();
    Simulation::new(client_server_routed(&config).expect("valid network"), config)
}

fn uc2() -> Simulation {
    let config = SimConfig::default();
    Simulation::new(arcd_uc2_network(&config).expect("valid network"), config)
}

fn step(sim: &mut Simulation) {
    let timestep = sim.timestep();
    sim.pre_timestep(timestep);
    sim.apply_timestep(timestep + 1);
}

fn browse(sim: &mut Simulation, hostname: &str) -> RequestResponse {
    apply(sim, request!["network", "node", hostname, "application", "web-browser", "execute"])
}

fn set_nic(sim: &mut Simulation, hostname: &str, verb: &str) {
    let response = apply(sim, request!["network", "node", hostname, "network_interface", 1, verb]);
    assert!(response.is_success());
}

fn add_rule(sim: &mut Simulation, rule: [&str; 9]) -> RequestResponse {
    let mut request = request!["network", "node", "router_1", "acl", "add_rule"];
    request.extend(rule.iter().map(|token| serde_json::Value::from(*token)));
    apply(sim, request)
}

fn acl_rule_count(sim: &Simulation) -> usize {
    sim.network
        .get_node("router_1")
        .and_then(|router| router.kind().acl())
        .map_or(0, |acl| acl.rules().count())
}

// ============================================================================
// ACL
// ============================================================================

#[test]
fn test_acl_deny_rule_blocks_server_until_removed() {
    let mut sim = routed();
    assert!(ping(&mut sim, "client_1", "192.168.1.2"));

    assert!(add_rule(&mut sim, ["PERMIT", "TCP", "ALL", "ALL", "HTTP", "ALL", "ALL", "HTTP", "1"]).is_success());
    assert!(add_rule(&mut sim, ["PERMIT", "UDP", "ALL", "ALL", "DNS", "ALL", "ALL", "DNS", "2"]).is_success());
    assert_eq!(acl_rule_count(&sim), 4);

    let deny = [
        "DENY",
        "ICMP",
        "192.168.2.2",
        "0.0.0.0",
        "ALL",
        "192.168.1.2",
        "0.0.0.0",
        "ALL",
        "4",
    ];
    assert!(add_rule(&mut sim, deny).is_success());
    assert_eq!(acl_rule_count(&sim), 5);

    assert!(!ping(&mut sim, "client_1", "192.168.1.2"));
    assert!(ping(&mut sim, "client_1", "192.168.1.1"));

    let removed = apply(&mut sim, request!["network", "node", "router_1", "acl", "remove_rule", 4]);
    assert!(removed.is_success());
    assert_eq!(acl_rule_count(&sim), 4);
    assert!(ping(&mut sim, "client_1", "192.168.1.2"));
}

#[test]
fn test_lower_position_permit_wins_over_deny() {
    let mut sim = routed();
    let deny = ["DENY", "ICMP", "ALL", "ALL", "ALL", "ALL", "ALL", "ALL", "10"];
    assert!(add_rule(&mut sim, deny).is_success());
    assert!(!ping(&mut sim, "client_1", "192.168.1.2"));

    let permit = ["PERMIT", "ICMP", "ALL", "ALL", "ALL", "ALL", "ALL", "ALL", "5"];
    assert!(add_rule(&mut sim, permit).is_success());
    assert!(ping(&mut sim, "client_1", "192.168.1.2"));
}

#[test]
fn test_acl_rule_with_bad_position_is_rejected() {
    let mut sim = routed();
    let response = add_rule(&mut sim, ["PERMIT", "ICMP", "ALL", "ALL", "ALL", "ALL", "ALL", "ALL", "99"]);
    assert!(!response.is_success());
    assert_eq!(acl_rule_count(&sim), 2);
}

// ============================================================================
// TTL
// ============================================================================

#[test]
fn test_every_layer3_hop_spends_one_ttl() {
    let config = SimConfig::default();
    let mut sim = Simulation::new(router_chain(3, &config).expect("valid network"), config);
    assert!(ping(&mut sim, "client", "10.0.3.10"));

    let server = sim.network.get_node("server").expect("present");
    let nic = server.network_interface(1).expect("nic");
    let echo_ttls: Vec<u8> = nic
        .pcap()
        .inbound()
        .filter(|captured| captured.protocol == IpProtocol::Icmp)
        .map(|captured| captured.ttl)
        .collect();
    assert!(!echo_ttls.is_empty());
    assert!(echo_ttls.iter().all(|ttl| *ttl == 64 - 4));
}

#[test]
fn test_ping_fails_when_ttl_runs_out() {
    let mut config = SimConfig::default();
    config.network.default_ttl = 4;
    let mut sim = Simulation::new(router_chain(3, &config).expect("valid network"), config);
    assert!(!ping(&mut sim, "client", "10.0.3.10"));

    let mut config = SimConfig::default();
    config.network.default_ttl = 5;
    let mut sim = Simulation::new(router_chain(3, &config).expect("valid network"), config);
    assert!(ping(&mut sim, "client", "10.0.3.10"));
}

// ============================================================================
// INTERFACES
// ============================================================================

#[test]
fn test_disabled_nic_cuts_only_that_client_off() {
    let mut sim = uc2();

    set_nic(&mut sim, "client_1", "disable");
    let client_1 = sim.network.get_node("client_1").expect("present");
    assert!(!client_1.network_interface(1).expect("nic").is_enabled());

    assert!(!browse(&mut sim, "client_1").is_success());
    assert!(!ping(&mut sim, "client_1", "192.168.1.12"));
    assert!(browse(&mut sim, "client_2").is_success());
    assert!(ping(&mut sim, "client_2", "192.168.1.12"));

    set_nic(&mut sim, "client_1", "enable");
    assert!(ping(&mut sim, "client_1", "192.168.1.12"));
    assert!(browse(&mut sim, "client_1").is_success());
}

#[test]
fn test_web_page_loads_again_once_database_server_is_back() {
    let mut sim = uc2();
    assert!(browse(&mut sim, "client_1").is_success());

    set_nic(&mut sim, "database_server", "disable");
    assert!(!browse(&mut sim, "client_1").is_success());
    assert!(!browse(&mut sim, "client_2").is_success());
    for _ in 0..3 {
        step(&mut sim);
    }

    set_nic(&mut sim, "database_server", "enable");
    for _ in 0..3 {
        step(&mut sim);
    }
    for _ in 0..5 {
        assert!(browse(&mut sim, "client_1").is_success());
    }
    assert!(browse(&mut sim, "client_2").is_success());
}

#[test]
fn test_web_page_recovers_when_outage_starts_before_first_query() {
    let mut sim = uc2();
    set_nic(&mut sim, "database_server", "disable");
    assert!(!browse(&mut sim, "client_1").is_success());
    // a second attempt in the same step must not wait on the lost connect
    assert!(!browse(&mut sim, "client_1").is_success());

    set_nic(&mut sim, "database_server", "enable");
    assert!(browse(&mut sim, "client_1").is_success());
}

#[test]
fn test_bot_attack_fails_when_database_is_unreachable() {
    let mut sim = uc2();
    let bot_stage = |sim: &Simulation| {
        sim.network
            .get_node("client_1")
            .and_then(|node| node.software_manager.application("data-manipulation-bot"))
            .and_then(|app| match app.kind() {
                ApplicationKind::DataManipulationBot(bot) => Some(bot.attack_stage()),
                _ => None,
            })
    };
    if let Some(app) = sim
        .network
        .get_node_mut("client_1")
        .and_then(|node| node.software_manager.application_mut("data-manipulation-bot"))
    {
        if let ApplicationKind::DataManipulationBot(bot) = app.kind_mut() {
            bot.port_scan_p_of_success = 1.0;
            bot.data_manipulation_p_of_success = 1.0;
            bot.repeat = false;
        }
    }

    set_nic(&mut sim, "database_server", "disable");
    let attack = apply(
        &mut sim,
        request!["network", "node", "client_1", "application", "data-manipulation-bot", "execute"],
    );
    assert!(attack.is_success());
    assert_eq!(bot_stage(&sim), Some(DataManipulationAttackStage::Failed));

    set_nic(&mut sim, "database_server", "enable");
    let health = "/network/nodes/database_server/file_system/folders/database/files/database.db/health_status";
    assert_eq!(sim.describe_state().pointer(health), Some(&serde_json::json!(1)));
}

#[test]
fn test_requests_to_unknown_nodes_are_invalid() {
    let sim = routed();
    let context = RequestContext::new(0);
    assert!(!sim.check_valid_request(&request!["network", "node", "client_9", "os", "scan"], &context));
    assert!(sim.check_valid_request(&request!["network", "node", "client_1", "os", "scan"], &context));
}
