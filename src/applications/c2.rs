//! Command and control
//!
//! A beacon on a compromised host checks in with its server every
//! `keep_alive_frequency` timesteps, hiding the traffic behind the port and
//! protocol of an ordinary service. While the link is up the server can send
//! commands. Each command is a request the beacon's node applies to itself;
//! the response travels back to the server as command output.
//!
//! A keep-alive still unanswered once the network is idle means the server
//! is gone: the beacon drops the connection and closes.

use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::frame::{port_from_name, IpProtocol, Port, DNS_PORT, FTP_PORT, HTTP_PORT};
use crate::protocols::{C2Packet, Payload};
use crate::request::{Request, RequestResponse};
use crate::software::{
    InboundPayload, NodeContext, OutboundPayload, RelayedRequest, SoftwareBehaviour, SoftwareCore, SoftwareEvent,
    SoftwareOptions,
};

/// Ports C2 traffic may hide behind
pub const MASQUERADE_PORTS: [Port; 3] = [FTP_PORT, HTTP_PORT, DNS_PORT];

pub const DEFAULT_KEEP_ALIVE_FREQUENCY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Masquerade {
    pub protocol: IpProtocol,
    pub port: Port,
}

impl Default for Masquerade {
    fn default() -> Self {
        Self {
            protocol: IpProtocol::Tcp,
            port: FTP_PORT,
        }
    }
}

impl Masquerade {
    pub fn new(protocol: IpProtocol, port: Port) -> Result<Self, ConfigError> {
        if protocol == IpProtocol::Icmp {
            return Err(ConfigError::Invalid(format!("c2: cannot masquerade as {}", protocol)));
        }
        if !MASQUERADE_PORTS.contains(&port) {
            return Err(ConfigError::Invalid(format!("c2: port {} is not a masquerade port", port)));
        }
        Ok(Self { protocol, port })
    }

    fn outbound(self, packet: C2Packet, dst_ip_address: Ipv4Addr) -> OutboundPayload {
        OutboundPayload {
            protocol: self.protocol,
            ..OutboundPayload::tcp(Payload::C2(packet), dst_ip_address, self.port)
        }
    }
}

// ============================================================================
// BEACON
// ============================================================================

/// Where and how a beacon reaches its server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconSettings {
    pub c2_server_ip_address: Option<Ipv4Addr>,
    pub keep_alive_frequency: u32,
    pub masquerade: Masquerade,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            c2_server_ip_address: None,
            keep_alive_frequency: DEFAULT_KEEP_ALIVE_FREQUENCY,
            masquerade: Masquerade::default(),
        }
    }
}

impl BeaconSettings {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let keep_alive_frequency = match options.f64("keep_alive_frequency")? {
            None => defaults.keep_alive_frequency,
            Some(frequency) if frequency >= 1.0 && frequency.fract() == 0.0 => frequency as u32,
            Some(frequency) => {
                return Err(ConfigError::Invalid(format!(
                    "c2-beacon: keep_alive_frequency {} must be a whole number of timesteps",
                    frequency
                )))
            }
        };
        let protocol = match options.string("masquerade_protocol")? {
            None => defaults.masquerade.protocol,
            Some(name) => IpProtocol::from_name(&name)
                .ok_or_else(|| ConfigError::Invalid(format!("c2-beacon: unknown protocol '{}'", name)))?,
        };
        let port = match options.string("masquerade_port")? {
            None => defaults.masquerade.port,
            Some(name) => port_from_name(&name)
                .or_else(|| name.parse().ok())
                .ok_or_else(|| ConfigError::Invalid(format!("c2-beacon: unknown port '{}'", name)))?,
        };
        Ok(Self {
            c2_server_ip_address: options.ip("c2_server_ip_address")?,
            keep_alive_frequency,
            masquerade: Masquerade::new(protocol, port)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct C2Beacon {
    settings: BeaconSettings,
    connection_active: bool,
    keep_alive_inactivity: u32,
    awaiting_keep_alive: bool,
    connection_lost: bool,
}

impl C2Beacon {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            settings: BeaconSettings::from_options(options)?,
            ..Self::default()
        })
    }

    pub fn settings(&self) -> BeaconSettings {
        self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection_active
    }

    pub fn keep_alive_inactivity(&self) -> u32 {
        self.keep_alive_inactivity
    }

    /// Point the beacon at a (new) server; any current connection is dropped
    pub fn configure(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, settings: BeaconSettings) -> bool {
        let Some(server) = settings.c2_server_ip_address else {
            ctx.sys_log.warning(format!("{}: cannot configure without a c2 server address", core.name));
            return false;
        };
        core.listen_on_ports.remove(&self.settings.masquerade.port);
        core.listen_on_ports.insert(settings.masquerade.port);
        self.settings = settings;
        self.connection_active = false;
        self.awaiting_keep_alive = false;
        self.keep_alive_inactivity = 0;
        ctx.sys_log.info(format!(
            "{}: configured for c2 server {} over {}/{} every {} timesteps",
            core.name, server, settings.masquerade.port, settings.masquerade.protocol, settings.keep_alive_frequency
        ));
        true
    }

    /// Check in with the server; the connection is up once it answers
    pub fn establish(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> bool {
        let Some(server) = self.settings.c2_server_ip_address else {
            ctx.sys_log
                .warning(format!("{}: no c2 server configured, unable to establish connection", core.name));
            return false;
        };
        self.send_keep_alive(core, ctx, server);
        true
    }

    fn send_keep_alive(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, server: Ipv4Addr) {
        let masquerade = self.settings.masquerade;
        ctx.sys_log.debug(format!("{}: keep alive sent to {}", core.name, server));
        ctx.send(masquerade.outbound(
            C2Packet::KeepAlive {
                masquerade_protocol: masquerade.protocol,
                masquerade_port: masquerade.port,
                keep_alive_frequency: self.settings.keep_alive_frequency,
            },
            server,
        ));
        self.awaiting_keep_alive = true;
    }

    /// True once after the server stopped answering
    pub(super) fn take_connection_lost(&mut self) -> bool {
        std::mem::take(&mut self.connection_lost)
    }
}

impl SoftwareBehaviour for C2Beacon {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::C2(packet) = &inbound.payload else {
            return false;
        };
        let Some(server) = self.settings.c2_server_ip_address else {
            return false;
        };
        if inbound.src_ip_address != server {
            ctx.sys_log
                .warning(format!("{}: ignoring c2 traffic from {}", core.name, inbound.src_ip_address));
            return false;
        }
        match packet {
            C2Packet::KeepAlive { .. } => {
                if !self.connection_active {
                    ctx.sys_log.info(format!("{}: connection established with {}", core.name, server));
                }
                self.connection_active = true;
                self.awaiting_keep_alive = false;
                self.keep_alive_inactivity = 0;
                true
            }
            C2Packet::Input { command_id, request } => {
                if !self.connection_active {
                    ctx.sys_log.warning(format!("{}: command before connection, ignored", core.name));
                    return false;
                }
                ctx.sys_log.info(format!("{}: received command {}", core.name, command_id));
                ctx.relay_request(RelayedRequest {
                    requester: core.name.clone(),
                    request_id: *command_id,
                    request: request.clone(),
                });
                true
            }
            C2Packet::Output { .. } => false,
        }
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        let SoftwareEvent::RelayedRequestCompleted {
            requester,
            request_id,
            response,
        } = event
        else {
            return false;
        };
        if *requester != core.name {
            return false;
        }
        if let Some(server) = self.settings.c2_server_ip_address {
            ctx.sys_log
                .info(format!("{}: command {} returned {}", core.name, request_id, response.status));
            ctx.send(self.settings.masquerade.outbound(
                C2Packet::Output {
                    command_id: *request_id,
                    response: response.clone(),
                },
                server,
            ));
        }
        false
    }

    fn apply_timestep(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        if !self.connection_active {
            return;
        }
        let Some(server) = self.settings.c2_server_ip_address else {
            return;
        };
        self.keep_alive_inactivity += 1;
        if self.keep_alive_inactivity >= self.settings.keep_alive_frequency {
            self.send_keep_alive(core, ctx, server);
        }
    }

    fn on_network_idle(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        if !self.awaiting_keep_alive {
            return;
        }
        self.awaiting_keep_alive = false;
        self.connection_active = false;
        self.connection_lost = true;
        ctx.sys_log
            .warning(format!("{}: keep alive unanswered, connection to c2 server lost", core.name));
    }

    fn on_install(&mut self, core: &mut SoftwareCore, _ctx: &mut NodeContext) {
        core.listen_on_ports.insert(self.settings.masquerade.port);
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("c2_connection_active".to_string(), Value::from(self.connection_active));
        state.insert(
            "c2_remote_connection".to_string(),
            self.settings
                .c2_server_ip_address
                .map_or(Value::Null, |ip| Value::from(ip.to_string())),
        );
        state.insert("keep_alive_inactivity".to_string(), Value::from(self.keep_alive_inactivity));
    }
}

// ============================================================================
// SERVER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct C2Server {
    beacon_ip_address: Option<Ipv4Addr>,
    masquerade: Masquerade,
    keep_alive_frequency: u32,
    keep_alive_inactivity: u32,
    connection_active: bool,
    pending_command: Option<u64>,
    command_output: Option<RequestResponse>,
}

impl C2Server {
    pub fn is_connected(&self) -> bool {
        self.connection_active
    }

    pub fn beacon_ip_address(&self) -> Option<Ipv4Addr> {
        self.beacon_ip_address
    }

    /// Send `request` for the beacon to apply on its node; false if no beacon is connected
    pub fn send_command(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, request: Request) -> bool {
        let (true, Some(beacon)) = (self.connection_active, self.beacon_ip_address) else {
            ctx.sys_log
                .warning(format!("{}: no c2 beacon connected, command rejected", core.name));
            self.command_output = Some(RequestResponse::failure().with_reason("no c2 beacon connected"));
            return false;
        };
        let command_id = ctx.next_id();
        ctx.sys_log
            .info(format!("{}: sending command {} to {}", core.name, command_id, beacon));
        self.pending_command = Some(command_id);
        self.command_output = None;
        ctx.send(self.masquerade.outbound(C2Packet::Input { command_id, request }, beacon));
        true
    }

    /// The beacon's answer to the last command
    pub fn command_response(&self) -> RequestResponse {
        self.command_output
            .clone()
            .unwrap_or_else(|| RequestResponse::failure().with_reason("c2 beacon did not answer"))
    }
}

impl SoftwareBehaviour for C2Server {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::C2(packet) = &inbound.payload else {
            return false;
        };
        match packet {
            C2Packet::KeepAlive {
                masquerade_protocol,
                masquerade_port,
                keep_alive_frequency,
            } => {
                if self.beacon_ip_address != Some(inbound.src_ip_address) || !self.connection_active {
                    ctx.sys_log
                        .info(format!("{}: c2 beacon {} connected", core.name, inbound.src_ip_address));
                }
                self.beacon_ip_address = Some(inbound.src_ip_address);
                self.masquerade = Masquerade {
                    protocol: *masquerade_protocol,
                    port: *masquerade_port,
                };
                self.keep_alive_frequency = *keep_alive_frequency;
                self.keep_alive_inactivity = 0;
                self.connection_active = true;
                ctx.send(self.masquerade.outbound(packet.clone(), inbound.src_ip_address));
                true
            }
            C2Packet::Output { command_id, response } => {
                if self.beacon_ip_address != Some(inbound.src_ip_address) || self.pending_command != Some(*command_id) {
                    ctx.sys_log
                        .warning(format!("{}: unexpected command output from {}", core.name, inbound.src_ip_address));
                    return false;
                }
                self.pending_command = None;
                self.command_output = Some(response.clone());
                true
            }
            C2Packet::Input { .. } => {
                ctx.sys_log.warning(format!("{}: c2 server received a command input", core.name));
                false
            }
        }
    }

    fn apply_timestep(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        if !self.connection_active {
            return;
        }
        self.keep_alive_inactivity += 1;
        if self.keep_alive_inactivity > self.keep_alive_frequency {
            self.connection_active = false;
            ctx.sys_log.warning(format!("{}: c2 beacon stopped checking in", core.name));
        }
    }

    fn on_install(&mut self, core: &mut SoftwareCore, _ctx: &mut NodeContext) {
        core.listen_on_ports.extend(MASQUERADE_PORTS);
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("c2_connection_active".to_string(), Value::from(self.connection_active));
        state.insert(
            "c2_remote_connection".to_string(),
            self.beacon_ip_address
                .map_or(Value::Null, |ip| Value::from(ip.to_string())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::request;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 21);
    const BEACON: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 12);

    fn context(hostname: &str) -> NodeContext {
        let mut ctx = NodeContext::new(hostname, &SimConfig::default());
        ctx.operational = true;
        ctx
    }

    fn inbound(outbound: OutboundPayload, src_ip_address: Ipv4Addr) -> InboundPayload {
        InboundPayload {
            payload: outbound.payload,
            src_ip_address,
            src_port: outbound.src_port,
            dst_port: outbound.dst_port,
            protocol: outbound.protocol,
        }
    }

    fn configured_beacon(frequency: u32) -> (C2Beacon, SoftwareCore, NodeContext) {
        let mut beacon = C2Beacon::default();
        let mut core = SoftwareCore::new("c2-beacon", None, IpProtocol::Tcp, 2);
        let mut ctx = context("web_server");
        let settings = BeaconSettings {
            c2_server_ip_address: Some(SERVER),
            keep_alive_frequency: frequency,
            masquerade: Masquerade::new(IpProtocol::Tcp, HTTP_PORT).expect("valid masquerade"),
        };
        assert!(beacon.configure(&mut core, &mut ctx, settings));
        (beacon, core, ctx)
    }

    /// Run the beacon's keep-alive past a server and back
    fn answer_keep_alive(
        beacon: &mut C2Beacon,
        core: &mut SoftwareCore,
        ctx: &mut NodeContext,
        server: &mut C2Server,
        server_core: &mut SoftwareCore,
        server_ctx: &mut NodeContext,
    ) {
        for outbound in ctx.take_outbound() {
            server.receive(server_core, server_ctx, &inbound(outbound, BEACON));
        }
        for outbound in server_ctx.take_outbound() {
            beacon.receive(core, ctx, &inbound(outbound, SERVER));
        }
    }

    #[test]
    fn test_beacon_options_parse_port_names() {
        let options = serde_json::json!({
            "c2_server_ip_address": "192.168.10.21",
            "keep_alive_frequency": 2,
            "masquerade_protocol": "udp",
            "masquerade_port": "DNS"
        });
        let options = options.as_object().cloned().unwrap_or_default();
        let settings = BeaconSettings::from_options(&SoftwareOptions::new("c2-beacon", &options)).expect("valid");
        assert_eq!(settings.c2_server_ip_address, Some(SERVER));
        assert_eq!(settings.keep_alive_frequency, 2);
        assert_eq!(settings.masquerade, Masquerade::new(IpProtocol::Udp, DNS_PORT).expect("valid"));

        let options = serde_json::json!({"masquerade_port": "POSTGRES_SERVER"});
        let options = options.as_object().cloned().unwrap_or_default();
        assert!(matches!(
            BeaconSettings::from_options(&SoftwareOptions::new("c2-beacon", &options)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_keep_alive_answered_connects_both_ends() {
        let (mut beacon, mut core, mut ctx) = configured_beacon(2);
        assert!(core.listen_on_ports.contains(&HTTP_PORT));
        let mut server = C2Server::default();
        let mut server_core = SoftwareCore::new("c2-server", None, IpProtocol::Tcp, 2);
        let mut server_ctx = context("client_1");

        assert!(beacon.establish(&core, &mut ctx));
        answer_keep_alive(&mut beacon, &mut core, &mut ctx, &mut server, &mut server_core, &mut server_ctx);
        assert!(beacon.is_connected());
        assert!(server.is_connected());
        assert_eq!(server.beacon_ip_address(), Some(BEACON));
    }

    #[test]
    fn test_beacon_checks_in_every_frequency_steps_and_drops_when_unanswered() {
        let (mut beacon, mut core, mut ctx) = configured_beacon(2);
        let mut server = C2Server::default();
        let mut server_core = SoftwareCore::new("c2-server", None, IpProtocol::Tcp, 2);
        let mut server_ctx = context("client_1");
        beacon.establish(&core, &mut ctx);
        answer_keep_alive(&mut beacon, &mut core, &mut ctx, &mut server, &mut server_core, &mut server_ctx);

        beacon.apply_timestep(&mut core, &mut ctx);
        assert_eq!(beacon.keep_alive_inactivity(), 1);
        assert!(ctx.take_outbound().is_empty());

        beacon.apply_timestep(&mut core, &mut ctx);
        answer_keep_alive(&mut beacon, &mut core, &mut ctx, &mut server, &mut server_core, &mut server_ctx);
        beacon.on_network_idle(&mut core, &mut ctx);
        assert_eq!(beacon.keep_alive_inactivity(), 0);
        assert!(beacon.is_connected());

        // the server has gone quiet
        beacon.apply_timestep(&mut core, &mut ctx);
        beacon.apply_timestep(&mut core, &mut ctx);
        assert_eq!(ctx.take_outbound().len(), 1);
        beacon.on_network_idle(&mut core, &mut ctx);
        assert_eq!(beacon.keep_alive_inactivity(), 2);
        assert!(!beacon.is_connected());
        assert!(beacon.take_connection_lost());
        assert!(!beacon.take_connection_lost());
    }

    #[test]
    fn test_command_is_relayed_and_output_returned() {
        let (mut beacon, mut core, mut ctx) = configured_beacon(5);
        let mut server = C2Server::default();
        let mut server_core = SoftwareCore::new("c2-server", None, IpProtocol::Tcp, 2);
        let mut server_ctx = context("client_1");
        beacon.establish(&core, &mut ctx);
        answer_keep_alive(&mut beacon, &mut core, &mut ctx, &mut server, &mut server_core, &mut server_ctx);

        let command = request!["file_system", "create_file", "loot", "passwords.txt"];
        assert!(server.send_command(&server_core, &mut server_ctx, command.clone()));
        let sent = server_ctx.take_outbound();
        assert_eq!(sent[0].dst_port, HTTP_PORT);
        for outbound in sent {
            assert!(beacon.receive(&mut core, &mut ctx, &inbound(outbound, SERVER)));
        }
        let relayed = ctx.take_relayed();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].request, command);

        let completed = SoftwareEvent::RelayedRequestCompleted {
            requester: "c2-beacon".to_string(),
            request_id: relayed[0].request_id,
            response: RequestResponse::success(),
        };
        beacon.on_event(&mut core, &mut ctx, &completed);
        for outbound in ctx.take_outbound() {
            assert!(server.receive(&mut server_core, &mut server_ctx, &inbound(outbound, BEACON)));
        }
        assert!(server.command_response().is_success());
    }

    #[test]
    fn test_server_rejects_command_without_beacon() {
        let mut server = C2Server::default();
        let core = SoftwareCore::new("c2-server", None, IpProtocol::Tcp, 2);
        let mut ctx = context("client_1");
        assert!(!server.send_command(&core, &mut ctx, request!["os", "scan"]));
        assert!(ctx.take_outbound().is_empty());
        assert_eq!(server.command_response().reason(), Some("no c2 beacon connected"));
    }

    #[test]
    fn test_server_drops_beacon_that_stops_checking_in() {
        let (mut beacon, mut core, mut ctx) = configured_beacon(2);
        let mut server = C2Server::default();
        let mut server_core = SoftwareCore::new("c2-server", None, IpProtocol::Tcp, 2);
        let mut server_ctx = context("client_1");
        beacon.establish(&core, &mut ctx);
        answer_keep_alive(&mut beacon, &mut core, &mut ctx, &mut server, &mut server_core, &mut server_ctx);

        server.apply_timestep(&mut server_core, &mut server_ctx);
        server.apply_timestep(&mut server_core, &mut server_ctx);
        assert!(server.is_connected());
        server.apply_timestep(&mut server_core, &mut server_ctx);
        assert!(!server.is_connected());
    }
}
