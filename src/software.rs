//! Shared software model
//!
//! Services and applications are both built from a [`SoftwareCore`] (health,
//! criticality, port binding) plus a kind-specific behaviour implementing
//! [`SoftwareBehaviour`]. Software never holds a reference to its node:
//! everything it may touch on the host (syslog, file system, addresses, the
//! outbound queue) is lent to it as a [`NodeContext`] for the duration of a
//! call.
//!
//! Software on the same node cooperates through [`SoftwareEvent`]s. A web
//! server wanting data emits `DatabaseQueryRequested`; the node's database
//! client serves it over the network and later emits `DatabaseQueryCompleted`.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::SimConfig;
use crate::error::ConfigError;
use crate::file_system::FileSystem;
use crate::frame::{fnv1a, IpProtocol, Port};
use crate::protocols::{FtpCommand, Payload};
use crate::request::{Request, RequestResponse};
use crate::sys_log::SysLog;

// ============================================================================
// HEALTH AND CRITICALITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SoftwareHealthState {
    /// Installed but never started
    Unused,
    Good,
    Fixing,
    Compromised,
    Overwhelmed,
    Corrupt,
}

impl SoftwareHealthState {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SoftwareHealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftwareHealthState::Unused => write!(f, "UNUSED"),
            SoftwareHealthState::Good => write!(f, "GOOD"),
            SoftwareHealthState::Fixing => write!(f, "FIXING"),
            SoftwareHealthState::Compromised => write!(f, "COMPROMISED"),
            SoftwareHealthState::Overwhelmed => write!(f, "OVERWHELMED"),
            SoftwareHealthState::Corrupt => write!(f, "CORRUPT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SoftwareCriticality {
    Lowest = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Highest = 5,
}

// ============================================================================
// PAYLOADS IN AND OUT
// ============================================================================

/// A payload handed up from the session layer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPayload {
    pub payload: Payload,
    pub src_ip_address: Ipv4Addr,
    pub src_port: Port,
    pub dst_port: Port,
    pub protocol: IpProtocol,
}

/// A payload software wants sent; the session layer turns it into a frame
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    pub payload: Payload,
    pub dst_ip_address: Ipv4Addr,
    pub dst_port: Port,
    pub src_port: Port,
    pub protocol: IpProtocol,
}

impl OutboundPayload {
    pub fn tcp(payload: Payload, dst_ip_address: Ipv4Addr, port: Port) -> Self {
        Self {
            payload,
            dst_ip_address,
            dst_port: port,
            src_port: port,
            protocol: IpProtocol::Tcp,
        }
    }

    pub fn udp(payload: Payload, dst_ip_address: Ipv4Addr, port: Port) -> Self {
        Self {
            protocol: IpProtocol::Udp,
            ..Self::tcp(payload, dst_ip_address, port)
        }
    }

    /// Answer `inbound` on the port it came from
    pub fn reply_to(inbound: &InboundPayload, payload: Payload) -> Self {
        Self {
            payload,
            dst_ip_address: inbound.src_ip_address,
            dst_port: inbound.src_port,
            src_port: inbound.dst_port,
            protocol: inbound.protocol,
        }
    }
}

// ============================================================================
// EVENTS BETWEEN SOFTWARE ON ONE NODE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseQuery {
    pub requester: String,
    pub request_id: u64,
    pub query: String,
    /// Overrides the client's configured server when set
    pub server_ip_address: Option<Ipv4Addr>,
    pub server_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpTransfer {
    pub requester: String,
    pub command: FtpCommand,
    pub dest_ip_address: Ipv4Addr,
    pub src_folder_name: String,
    pub src_file_name: String,
    pub dest_folder_name: String,
    pub dest_file_name: String,
}

/// A request software asks its own node to apply
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedRequest {
    pub requester: String,
    pub request_id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SoftwareEvent {
    DomainLookupRequested {
        requester: String,
        domain_name: String,
    },
    DomainResolved {
        domain_name: String,
        ip_address: Option<Ipv4Addr>,
    },
    DatabaseQueryRequested(DatabaseQuery),
    DatabaseQueryCompleted {
        requester: String,
        request_id: u64,
        success: bool,
    },
    FtpTransferRequested(FtpTransfer),
    FileTransferCompleted {
        requester: String,
        command: FtpCommand,
        folder_name: String,
        file_name: String,
        success: bool,
    },
    RelayedRequestCompleted {
        requester: String,
        request_id: u64,
        response: RequestResponse,
    },
}

impl SoftwareEvent {
    /// The failure answer to a request that no software on the node served
    pub fn unserved_reply(&self) -> Option<SoftwareEvent> {
        match self {
            SoftwareEvent::DomainLookupRequested { domain_name, .. } => Some(SoftwareEvent::DomainResolved {
                domain_name: domain_name.clone(),
                ip_address: None,
            }),
            SoftwareEvent::DatabaseQueryRequested(query) => Some(SoftwareEvent::DatabaseQueryCompleted {
                requester: query.requester.clone(),
                request_id: query.request_id,
                success: false,
            }),
            SoftwareEvent::FtpTransferRequested(transfer) => Some(SoftwareEvent::FileTransferCompleted {
                requester: transfer.requester.clone(),
                command: transfer.command,
                folder_name: transfer.dest_folder_name.clone(),
                file_name: transfer.dest_file_name.clone(),
                success: false,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// NODE CONTEXT
// ============================================================================

/// Host resources lent to software while it runs
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub hostname: String,
    /// True while the node is powered on
    pub operational: bool,
    pub timestep: u64,
    pub sys_log: SysLog,
    pub file_system: FileSystem,
    pub ip_addresses: Vec<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
    pub rng: ChaCha8Rng,
    next_id: u64,
    outbound: Vec<OutboundPayload>,
    events: VecDeque<SoftwareEvent>,
    relayed: Vec<RelayedRequest>,
}

impl NodeContext {
    pub fn new(hostname: &str, config: &SimConfig) -> Self {
        let seed = config.game.seed.wrapping_add(fnv1a(hostname.as_bytes()));
        Self {
            hostname: hostname.to_string(),
            operational: false,
            timestep: 0,
            sys_log: SysLog::new(hostname, config.logging.sys_log_capacity),
            file_system: FileSystem::new(config.file_system),
            ip_addresses: Vec::new(),
            dns_server: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_id: 1,
            outbound: Vec::new(),
            events: VecDeque::new(),
            relayed: Vec::new(),
        }
    }

    pub fn set_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
        self.sys_log.set_timestep(timestep);
    }

    /// Node-unique identifier for requests, connections and transfers
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn send(&mut self, outbound: OutboundPayload) {
        self.outbound.push(outbound);
    }

    pub fn emit(&mut self, event: SoftwareEvent) {
        self.events.push_back(event);
    }

    pub fn take_outbound(&mut self) -> Vec<OutboundPayload> {
        std::mem::take(&mut self.outbound)
    }

    /// Queue a request for the node; the outcome comes back as `RelayedRequestCompleted`
    pub fn relay_request(&mut self, relayed: RelayedRequest) {
        self.relayed.push(relayed);
    }

    pub fn take_relayed(&mut self) -> Vec<RelayedRequest> {
        std::mem::take(&mut self.relayed)
    }

    pub(crate) fn pop_event(&mut self) -> Option<SoftwareEvent> {
        self.events.pop_front()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.outbound.is_empty() || !self.events.is_empty() || !self.relayed.is_empty()
    }
}

// ============================================================================
// SOFTWARE CORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SoftwareCore {
    pub name: String,
    pub health_state_actual: SoftwareHealthState,
    /// Only refreshed by a scan
    pub health_state_visible: SoftwareHealthState,
    pub criticality: SoftwareCriticality,
    pub port: Option<Port>,
    pub protocol: IpProtocol,
    /// Extra ports this software passively listens on
    pub listen_on_ports: BTreeSet<Port>,
    pub revealed_to_red: bool,
    pub payloads_received: u64,
    fixing_duration: u32,
    fixing_countdown: Option<u32>,
}

impl SoftwareCore {
    pub fn new(name: &str, port: Option<Port>, protocol: IpProtocol, fixing_duration: u32) -> Self {
        Self {
            name: name.to_string(),
            health_state_actual: SoftwareHealthState::Unused,
            health_state_visible: SoftwareHealthState::Unused,
            criticality: SoftwareCriticality::Lowest,
            port,
            protocol,
            listen_on_ports: BTreeSet::new(),
            revealed_to_red: false,
            payloads_received: 0,
            fixing_duration,
            fixing_countdown: None,
        }
    }

    pub fn set_health_state(&mut self, health_state: SoftwareHealthState) {
        self.health_state_actual = health_state;
    }

    pub fn scan(&mut self, sys_log: &mut SysLog) -> bool {
        self.health_state_visible = self.health_state_actual;
        sys_log.debug(format!("{}: scanned, health is {}", self.name, self.health_state_actual));
        true
    }

    pub fn reveal_to_red(&mut self) -> bool {
        self.revealed_to_red = true;
        true
    }

    pub fn is_fixing(&self) -> bool {
        self.fixing_countdown.is_some()
    }

    /// Start the FIXING countdown.
    pub fn fix(&mut self, sys_log: &mut SysLog) -> bool {
        if matches!(
            self.health_state_actual,
            SoftwareHealthState::Unused | SoftwareHealthState::Fixing
        ) {
            sys_log.debug(format!("{}: nothing to fix", self.name));
            return false;
        }
        sys_log.info(format!("{}: fixing", self.name));
        self.health_state_actual = SoftwareHealthState::Fixing;
        self.fixing_countdown = Some(self.fixing_duration.max(1));
        true
    }

    /// Advance the fix countdown; true on the step it completes.
    pub(crate) fn tick_fix(&mut self, sys_log: &mut SysLog) -> bool {
        if !crate::tick_countdown(&mut self.fixing_countdown) {
            return false;
        }
        self.health_state_actual = SoftwareHealthState::Good;
        sys_log.info(format!("{}: fix complete", self.name));
        true
    }

    pub fn describe_state(&self) -> Map<String, Value> {
        let state = json!({
            "health_state_actual": self.health_state_actual.value(),
            "health_state_visible": self.health_state_visible.value(),
            "criticality": self.criticality as u8,
            "revealed_to_red": self.revealed_to_red,
            "port": self.port,
            "protocol": self.protocol,
            "listen_on_ports": self.listen_on_ports,
            "payloads_received": self.payloads_received,
        });
        match state {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

// ============================================================================
// CONFIG OPTIONS
// ============================================================================

/// Typed access to the JSON options of a software config entry
pub struct SoftwareOptions<'a> {
    type_tag: &'a str,
    options: &'a Map<String, Value>,
}

impl<'a> SoftwareOptions<'a> {
    pub fn new(type_tag: &'a str, options: &'a Map<String, Value>) -> Self {
        Self { type_tag, options }
    }

    fn invalid(&self, key: &str, expected: &str) -> ConfigError {
        ConfigError::Invalid(format!("{}: option '{}' must be {}", self.type_tag, key, expected))
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub fn ip(&self, key: &str) -> Result<Option<Ipv4Addr>, ConfigError> {
        match self.string(key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, "an IPv4 address")),
        }
    }

    pub fn f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| self.invalid(key, "a number")),
        }
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_bool().map(Some).ok_or_else(|| self.invalid(key, "a boolean")),
        }
    }

    pub fn object(&self, key: &str) -> Result<Option<&'a Map<String, Value>>, ConfigError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(self.invalid(key, "an object")),
        }
    }
}

/// Kind-specific behaviour; every hook defaults to doing nothing.
///
/// Hooks are only called while the owning software can act (node on,
/// software running), apart from `on_install`.
pub trait SoftwareBehaviour {
    /// Handle a payload addressed to this software; true if it was understood
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let _ = (core, ctx, inbound);
        false
    }

    /// React to an event from other software; true if this software served a request event
    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        let _ = (core, ctx, event);
        false
    }

    fn apply_timestep(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        let _ = (core, ctx);
    }

    /// Called once the network has delivered everything; replies still
    /// outstanding at this point were lost
    fn on_network_idle(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        let _ = (core, ctx);
    }

    /// Called when a FIXING countdown completes
    fn on_fixed(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        let _ = (core, ctx);
    }

    fn on_install(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        let _ = (core, ctx);
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        let _ = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_visible_health_waits_for_scan() {
        let mut sys_log = SysLog::new("web_server", 10);
        let mut core = SoftwareCore::new("web-server", Some(80), IpProtocol::Tcp, 2);
        core.set_health_state(SoftwareHealthState::Good);
        core.scan(&mut sys_log);

        core.set_health_state(SoftwareHealthState::Compromised);
        assert_eq!(core.health_state_visible, SoftwareHealthState::Good);
        core.scan(&mut sys_log);
        assert_eq!(core.health_state_visible, SoftwareHealthState::Compromised);
    }

    #[test]
    fn test_fix_counts_down_to_good() {
        let mut sys_log = SysLog::new("web_server", 10);
        let mut core = SoftwareCore::new("web-server", Some(80), IpProtocol::Tcp, 2);
        assert!(!core.fix(&mut sys_log));

        core.set_health_state(SoftwareHealthState::Compromised);
        assert!(core.fix(&mut sys_log));
        assert_eq!(core.health_state_actual, SoftwareHealthState::Fixing);
        assert!(!core.tick_fix(&mut sys_log));
        assert!(core.tick_fix(&mut sys_log));
        assert_eq!(core.health_state_actual, SoftwareHealthState::Good);
        assert!(!core.is_fixing());
    }

    #[test]
    fn test_unserved_requests_fail() {
        let event = SoftwareEvent::DatabaseQueryRequested(DatabaseQuery {
            requester: "web-server".to_string(),
            request_id: 9,
            query: "SELECT".to_string(),
            server_ip_address: None,
            server_password: None,
        });
        assert_eq!(
            event.unserved_reply(),
            Some(SoftwareEvent::DatabaseQueryCompleted {
                requester: "web-server".to_string(),
                request_id: 9,
                success: false,
            })
        );
        let resolved = SoftwareEvent::DomainResolved {
            domain_name: "arcd.com".to_string(),
            ip_address: None,
        };
        assert_eq!(resolved.unserved_reply(), None);
    }

    #[test]
    fn test_options_are_type_checked() {
        let options = serde_json::json!({"server_ip": "192.168.1.14", "repeat": true, "payload": 5});
        let options = options.as_object().cloned().unwrap_or_default();
        let typed = SoftwareOptions::new("data-manipulation-bot", &options);
        assert_eq!(typed.ip("server_ip"), Ok(Some(Ipv4Addr::new(192, 168, 1, 14))));
        assert_eq!(typed.bool("repeat"), Ok(Some(true)));
        assert_eq!(typed.f64("missing"), Ok(None));
        assert!(matches!(typed.string("payload"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_context_rng_is_seeded_per_host() {
        let config = SimConfig::default();
        let mut first = NodeContext::new("client_1", &config);
        let mut again = NodeContext::new("client_1", &config);
        let mut other = NodeContext::new("client_2", &config);
        let a: Vec<u32> = (0..4).map(|_| first.rng.gen()).collect();
        let b: Vec<u32> = (0..4).map(|_| again.rng.gen()).collect();
        let c: Vec<u32> = (0..4).map(|_| other.rng.gen()).collect();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
