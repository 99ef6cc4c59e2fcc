//! Services: software that is started when installed and keeps running
//!
//! A [`Service`] wraps the shared [`SoftwareCore`] with a service operating
//! state and one concrete behaviour from [`ServiceKind`]. Lifecycle rules:
//!
//! - `start` needs the node on and the service STOPPED
//! - `stop` from RUNNING or PAUSED
//! - `pause`/`resume` toggle RUNNING and PAUSED
//! - `restart` from RUNNING or PAUSED, back to RUNNING after the restart duration
//! - `disable` from anywhere; `enable` returns a DISABLED service to STOPPED

pub mod arp;
pub mod database_service;
pub mod dns;
pub mod ftp;
pub mod icmp;
pub mod ntp;
pub mod web_server;

pub use arp::*;
pub use database_service::*;
pub use dns::*;
pub use ftp::*;
pub use icmp::*;
pub use ntp::*;
pub use web_server::*;

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{SoftwareConfig, SoftwareTimings};
use crate::error::{ConfigError, RequestError};
use crate::frame::{IpProtocol, Port, ARP_PORT, DNS_PORT, FTP_PORT, HTTP_PORT, NTP_PORT, POSTGRES_PORT};
use crate::request::{
    arg_str, expect_args, RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken,
    RequestType,
};
use crate::software::{InboundPayload, NodeContext, SoftwareBehaviour, SoftwareCore, SoftwareEvent, SoftwareHealthState};
use crate::tick_countdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceOperatingState {
    Running = 1,
    Stopped = 2,
    Paused = 3,
    Disabled = 4,
    Installing = 5,
    Restarting = 6,
}

impl fmt::Display for ServiceOperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOperatingState::Running => write!(f, "RUNNING"),
            ServiceOperatingState::Stopped => write!(f, "STOPPED"),
            ServiceOperatingState::Paused => write!(f, "PAUSED"),
            ServiceOperatingState::Disabled => write!(f, "DISABLED"),
            ServiceOperatingState::Installing => write!(f, "INSTALLING"),
            ServiceOperatingState::Restarting => write!(f, "RESTARTING"),
        }
    }
}

// ============================================================================
// SERVICE KINDS
// ============================================================================

pub const SERVICE_TYPE_TAGS: [&str; 10] = [
    "arp",
    "icmp",
    "dns-client",
    "dns-server",
    "web-server",
    "database-service",
    "ftp-client",
    "ftp-server",
    "ntp-client",
    "ntp-server",
];

#[derive(Debug, Clone)]
pub enum ServiceKind {
    Arp(Arp),
    Icmp(Icmp),
    DnsClient(DnsClient),
    DnsServer(DnsServer),
    WebServer(WebServer),
    DatabaseService(DatabaseService),
    FtpClient(FtpClient),
    FtpServer(FtpServer),
    NtpClient(NtpClient),
    NtpServer(NtpServer),
}

impl ServiceKind {
    pub fn is_service_tag(tag: &str) -> bool {
        SERVICE_TYPE_TAGS.contains(&tag)
    }

    /// Build a service behaviour from its config type tag and options
    pub fn from_config(config: &SoftwareConfig) -> Result<Self, ConfigError> {
        let tag = config.software_type.as_str();
        let options = crate::software::SoftwareOptions::new(tag, &config.options);
        let kind = match tag {
            "arp" => ServiceKind::Arp(Arp::default()),
            "icmp" => ServiceKind::Icmp(Icmp::default()),
            "dns-client" => ServiceKind::DnsClient(DnsClient::from_options(&options)?),
            "dns-server" => ServiceKind::DnsServer(DnsServer::from_options(&options)?),
            "web-server" => ServiceKind::WebServer(WebServer::default()),
            "database-service" => ServiceKind::DatabaseService(DatabaseService::from_options(&options)?),
            "ftp-client" => ServiceKind::FtpClient(FtpClient::default()),
            "ftp-server" => ServiceKind::FtpServer(FtpServer::default()),
            "ntp-client" => ServiceKind::NtpClient(NtpClient::from_options(&options)?),
            "ntp-server" => ServiceKind::NtpServer(NtpServer::default()),
            other => return Err(ConfigError::UnknownServiceType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn from_type_tag(tag: &str) -> Result<Self, ConfigError> {
        Self::from_config(&SoftwareConfig::new(tag))
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ServiceKind::Arp(_) => "arp",
            ServiceKind::Icmp(_) => "icmp",
            ServiceKind::DnsClient(_) => "dns-client",
            ServiceKind::DnsServer(_) => "dns-server",
            ServiceKind::WebServer(_) => "web-server",
            ServiceKind::DatabaseService(_) => "database-service",
            ServiceKind::FtpClient(_) => "ftp-client",
            ServiceKind::FtpServer(_) => "ftp-server",
            ServiceKind::NtpClient(_) => "ntp-client",
            ServiceKind::NtpServer(_) => "ntp-server",
        }
    }

    /// Port and protocol the service binds
    pub fn binding(&self) -> (Option<Port>, IpProtocol) {
        match self {
            ServiceKind::Arp(_) => (Some(ARP_PORT), IpProtocol::Udp),
            ServiceKind::Icmp(_) => (None, IpProtocol::Icmp),
            ServiceKind::DnsClient(_) | ServiceKind::DnsServer(_) => (Some(DNS_PORT), IpProtocol::Tcp),
            ServiceKind::WebServer(_) => (Some(HTTP_PORT), IpProtocol::Tcp),
            ServiceKind::DatabaseService(_) => (Some(POSTGRES_PORT), IpProtocol::Tcp),
            ServiceKind::FtpClient(_) | ServiceKind::FtpServer(_) => (Some(FTP_PORT), IpProtocol::Tcp),
            ServiceKind::NtpClient(_) | ServiceKind::NtpServer(_) => (Some(NTP_PORT), IpProtocol::Udp),
        }
    }

    fn behaviour(&self) -> &dyn SoftwareBehaviour {
        match self {
            ServiceKind::Arp(inner) => inner,
            ServiceKind::Icmp(inner) => inner,
            ServiceKind::DnsClient(inner) => inner,
            ServiceKind::DnsServer(inner) => inner,
            ServiceKind::WebServer(inner) => inner,
            ServiceKind::DatabaseService(inner) => inner,
            ServiceKind::FtpClient(inner) => inner,
            ServiceKind::FtpServer(inner) => inner,
            ServiceKind::NtpClient(inner) => inner,
            ServiceKind::NtpServer(inner) => inner,
        }
    }

    fn behaviour_mut(&mut self) -> &mut dyn SoftwareBehaviour {
        match self {
            ServiceKind::Arp(inner) => inner,
            ServiceKind::Icmp(inner) => inner,
            ServiceKind::DnsClient(inner) => inner,
            ServiceKind::DnsServer(inner) => inner,
            ServiceKind::WebServer(inner) => inner,
            ServiceKind::DatabaseService(inner) => inner,
            ServiceKind::FtpClient(inner) => inner,
            ServiceKind::FtpServer(inner) => inner,
            ServiceKind::NtpClient(inner) => inner,
            ServiceKind::NtpServer(inner) => inner,
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub struct Service {
    pub core: SoftwareCore,
    operating_state: ServiceOperatingState,
    restart_duration: u32,
    restart_countdown: Option<u32>,
    kind: ServiceKind,
    request_manager: RequestManager<Service, NodeContext>,
}

impl Service {
    pub fn new(kind: ServiceKind, timings: SoftwareTimings) -> Self {
        let (port, protocol) = kind.binding();
        let request_manager = service_request_manager(&kind);
        Self {
            core: SoftwareCore::new(kind.type_tag(), port, protocol, timings.fixing_duration),
            operating_state: ServiceOperatingState::Stopped,
            restart_duration: timings.restart_duration,
            restart_countdown: None,
            kind,
            request_manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn operating_state(&self) -> ServiceOperatingState {
        self.operating_state
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ServiceKind {
        &mut self.kind
    }

    pub fn can_perform_action(&self, ctx: &NodeContext) -> bool {
        ctx.operational && self.operating_state == ServiceOperatingState::Running
    }

    pub fn start(&mut self, ctx: &mut NodeContext) -> bool {
        if !ctx.operational {
            ctx.sys_log.error(format!("Unable to start service {}. Node is not on.", self.core.name));
            return false;
        }
        if self.operating_state != ServiceOperatingState::Stopped {
            return false;
        }
        ctx.sys_log.info(format!("Starting service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Running;
        if self.core.health_state_actual == SoftwareHealthState::Unused {
            self.core.set_health_state(SoftwareHealthState::Good);
        }
        true
    }

    pub fn stop(&mut self, ctx: &mut NodeContext) -> bool {
        if !matches!(
            self.operating_state,
            ServiceOperatingState::Running | ServiceOperatingState::Paused
        ) {
            return false;
        }
        ctx.sys_log.info(format!("Stopping service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Stopped;
        true
    }

    pub fn pause(&mut self, ctx: &mut NodeContext) -> bool {
        if self.operating_state != ServiceOperatingState::Running {
            return false;
        }
        ctx.sys_log.info(format!("Pausing service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Paused;
        true
    }

    pub fn resume(&mut self, ctx: &mut NodeContext) -> bool {
        if self.operating_state != ServiceOperatingState::Paused {
            return false;
        }
        ctx.sys_log.info(format!("Resuming service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Running;
        true
    }

    pub fn restart(&mut self, ctx: &mut NodeContext) -> bool {
        if !matches!(
            self.operating_state,
            ServiceOperatingState::Running | ServiceOperatingState::Paused
        ) {
            return false;
        }
        ctx.sys_log.info(format!("Restarting service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Restarting;
        self.restart_countdown = Some(self.restart_duration.max(1));
        true
    }

    pub fn disable(&mut self, ctx: &mut NodeContext) -> bool {
        ctx.sys_log.info(format!("Disabling service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Disabled;
        self.restart_countdown = None;
        true
    }

    pub fn enable(&mut self, ctx: &mut NodeContext) -> bool {
        if self.operating_state != ServiceOperatingState::Disabled {
            return false;
        }
        ctx.sys_log.info(format!("Enabling service {}", self.core.name));
        self.operating_state = ServiceOperatingState::Stopped;
        true
    }

    pub(crate) fn install(&mut self, ctx: &mut NodeContext) {
        let Service { core, kind, .. } = self;
        kind.behaviour_mut().on_install(core, ctx);
    }

    pub fn receive(&mut self, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        if !self.can_perform_action(ctx) {
            ctx.sys_log.debug(format!(
                "{} dropped payload, service is {}",
                self.core.name, self.operating_state
            ));
            return false;
        }
        self.core.payloads_received += 1;
        let Service { core, kind, .. } = self;
        kind.behaviour_mut().receive(core, ctx, inbound)
    }

    pub fn on_event(&mut self, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        if !self.can_perform_action(ctx) {
            return false;
        }
        let Service { core, kind, .. } = self;
        kind.behaviour_mut().on_event(core, ctx, event)
    }

    pub fn network_idle(&mut self, ctx: &mut NodeContext) {
        if self.can_perform_action(ctx) {
            let Service { core, kind, .. } = self;
            kind.behaviour_mut().on_network_idle(core, ctx);
        }
    }

    pub fn apply_timestep(&mut self, ctx: &mut NodeContext) {
        if self.operating_state == ServiceOperatingState::Restarting && tick_countdown(&mut self.restart_countdown) {
            ctx.sys_log.info(format!("Service {} restarted", self.core.name));
            self.operating_state = ServiceOperatingState::Running;
        }
        if self.core.tick_fix(&mut ctx.sys_log) && self.can_perform_action(ctx) {
            let Service { core, kind, .. } = self;
            kind.behaviour_mut().on_fixed(core, ctx);
        }
        if self.can_perform_action(ctx) {
            let Service { core, kind, .. } = self;
            kind.behaviour_mut().apply_timestep(core, ctx);
        }
    }

    pub fn describe_state(&self) -> Value {
        let mut state: Map<String, Value> = self.core.describe_state();
        state.insert("type".to_string(), Value::from(self.kind.type_tag()));
        state.insert("operating_state".to_string(), Value::from(self.operating_state as u8));
        self.kind.behaviour().describe_state(&mut state);
        Value::Object(state)
    }
}

impl RequestHandler<NodeContext> for Service {
    fn request_manager(&self) -> &RequestManager<Self, NodeContext> {
        &self.request_manager
    }
}

/// Pending while traffic is in flight, failure when nothing could be sent
pub(crate) fn pending_if(started: bool) -> RequestResponse {
    if started {
        RequestResponse::pending()
    } else {
        RequestResponse::failure()
    }
}

fn service_request_manager(kind: &ServiceKind) -> RequestManager<Service, NodeContext> {
    fn scan(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.core.scan(&mut ctx.sys_log)))
    }
    fn fix(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.core.fix(&mut ctx.sys_log)))
    }
    fn start(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.start(ctx)))
    }
    fn stop(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.stop(ctx)))
    }
    fn pause(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.pause(ctx)))
    }
    fn resume(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.resume(ctx)))
    }
    fn restart(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.restart(ctx)))
    }
    fn disable(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.disable(ctx)))
    }
    fn enable(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(service.enable(ctx)))
    }

    fn backup(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        if !service.can_perform_action(ctx) {
            return Ok(RequestResponse::failure().with_reason("service is not running"));
        }
        let Service { core, kind, .. } = service;
        let started = match kind {
            ServiceKind::DatabaseService(db) => db.backup_database(core, ctx),
            _ => false,
        };
        Ok(pending_if(started))
    }
    fn backup_settled(service: &mut Service, _: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        match &service.kind {
            ServiceKind::DatabaseService(db) => Ok(RequestResponse::from_bool(db.last_backup_succeeded())),
            _ => Ok(RequestResponse::failure()),
        }
    }
    fn restore(service: &mut Service, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        if !service.can_perform_action(ctx) {
            return Ok(RequestResponse::failure().with_reason("service is not running"));
        }
        let Service { core, kind, .. } = service;
        let started = match kind {
            ServiceKind::DatabaseService(db) => db.restore_backup(core, ctx),
            _ => false,
        };
        Ok(pending_if(started))
    }
    fn restore_settled(service: &mut Service, _: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        match &service.kind {
            ServiceKind::DatabaseService(db) => Ok(RequestResponse::from_bool(db.last_restore_succeeded())),
            _ => Ok(RequestResponse::failure()),
        }
    }

    fn lookup(service: &mut Service, ctx: &mut NodeContext, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "lookup")?;
        let domain_name = arg_str(request, 0, "lookup", "domain_name")?;
        if !service.can_perform_action(ctx) {
            return Ok(RequestResponse::failure().with_reason("service is not running"));
        }
        let Service { core, kind, .. } = service;
        let ServiceKind::DnsClient(client) = kind else {
            return Ok(RequestResponse::failure());
        };
        if client.cached(&domain_name).is_some() {
            return Ok(RequestResponse::success());
        }
        Ok(pending_if(client.lookup(core, ctx, &domain_name)))
    }
    fn lookup_settled(service: &mut Service, _: &mut NodeContext, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let domain_name = arg_str(request, 0, "lookup", "domain_name")?;
        match &service.kind {
            ServiceKind::DnsClient(client) => Ok(RequestResponse::from_bool(client.cached(&domain_name).is_some())),
            _ => Ok(RequestResponse::failure()),
        }
    }

    // [dest_ip, src_folder, src_file, dest_folder, dest_file]
    fn send(service: &mut Service, ctx: &mut NodeContext, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 5, "send")?;
        let dest_ip_address = crate::request::arg_parse(request, 0, "send", "dest_ip")?;
        let transfer = crate::software::FtpTransfer {
            requester: service.core.name.clone(),
            command: crate::protocols::FtpCommand::Stor,
            dest_ip_address,
            src_folder_name: arg_str(request, 1, "send", "src_folder")?,
            src_file_name: arg_str(request, 2, "send", "src_file")?,
            dest_folder_name: arg_str(request, 3, "send", "dest_folder")?,
            dest_file_name: arg_str(request, 4, "send", "dest_file")?,
        };
        if !service.can_perform_action(ctx) {
            return Ok(RequestResponse::failure().with_reason("service is not running"));
        }
        let Service { core, kind, .. } = service;
        let started = match kind {
            ServiceKind::FtpClient(client) => client.start_transfer(core, ctx, transfer).is_some(),
            _ => false,
        };
        Ok(pending_if(started))
    }
    fn send_settled(service: &mut Service, _: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        match &service.kind {
            ServiceKind::FtpClient(client) => Ok(RequestResponse::from_bool(client.last_transfer_succeeded())),
            _ => Ok(RequestResponse::failure()),
        }
    }

    let manager = RequestManager::new()
        .with("scan", RequestType::new(scan))
        .with("fix", RequestType::new(fix))
        .with("start", RequestType::new(start))
        .with("stop", RequestType::new(stop))
        .with("pause", RequestType::new(pause))
        .with("resume", RequestType::new(resume))
        .with("restart", RequestType::new(restart))
        .with("disable", RequestType::new(disable))
        .with("enable", RequestType::new(enable));

    match kind {
        ServiceKind::DatabaseService(_) => manager
            .with("backup", RequestType::new(backup).with_settle(backup_settled))
            .with("restore", RequestType::new(restore).with_settle(restore_settled)),
        ServiceKind::DnsClient(_) => manager.with("lookup", RequestType::new(lookup).with_settle(lookup_settled)),
        ServiceKind::FtpClient(_) => manager.with("send", RequestType::new(send).with_settle(send_settled)),
        _ => manager,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::request;

    fn running_service(restart_duration: u32) -> (Service, NodeContext) {
        let config = SimConfig::default();
        let mut ctx = NodeContext::new("web_server", &config);
        ctx.operational = true;
        let timings = SoftwareTimings {
            restart_duration,
            ..SoftwareTimings::default()
        };
        let mut service = Service::new(ServiceKind::WebServer(WebServer::default()), timings);
        assert!(service.start(&mut ctx));
        (service, ctx)
    }

    #[test]
    fn test_start_requires_node_on_and_marks_health_good() {
        let config = SimConfig::default();
        let mut ctx = NodeContext::new("web_server", &config);
        let mut service = Service::new(ServiceKind::WebServer(WebServer::default()), config.software);
        assert!(!service.start(&mut ctx));
        assert_eq!(service.core.health_state_actual, SoftwareHealthState::Unused);

        ctx.operational = true;
        assert!(service.start(&mut ctx));
        assert_eq!(service.operating_state(), ServiceOperatingState::Running);
        assert_eq!(service.core.health_state_actual, SoftwareHealthState::Good);
        assert!(!service.start(&mut ctx));
    }

    #[test]
    fn test_restart_takes_exactly_restart_duration_steps() {
        let (mut service, mut ctx) = running_service(3);
        assert!(service.restart(&mut ctx));
        for _ in 0..2 {
            service.apply_timestep(&mut ctx);
            assert_eq!(service.operating_state(), ServiceOperatingState::Restarting);
        }
        service.apply_timestep(&mut ctx);
        assert_eq!(service.operating_state(), ServiceOperatingState::Running);
    }

    #[test]
    fn test_disable_and_enable_via_requests() {
        let (mut service, mut ctx) = running_service(5);
        let context = RequestContext::new(0);

        let response = service.handle_request(&mut ctx, &request!["disable"], &context).expect("routed");
        assert!(response.is_success());
        assert_eq!(service.operating_state(), ServiceOperatingState::Disabled);

        let response = service.handle_request(&mut ctx, &request!["start"], &context).expect("routed");
        assert!(!response.is_success());

        service.handle_request(&mut ctx, &request!["enable"], &context).expect("routed");
        assert_eq!(service.operating_state(), ServiceOperatingState::Stopped);
        service.handle_request(&mut ctx, &request!["start"], &context).expect("routed");
        assert_eq!(service.operating_state(), ServiceOperatingState::Running);
    }

    #[test]
    fn test_paused_service_ignores_payloads() {
        let (mut service, mut ctx) = running_service(5);
        service.pause(&mut ctx);
        let inbound = InboundPayload {
            payload: crate::protocols::Payload::Raw("GET".to_string()),
            src_ip_address: std::net::Ipv4Addr::new(192, 168, 10, 21),
            src_port: HTTP_PORT,
            dst_port: HTTP_PORT,
            protocol: IpProtocol::Tcp,
        };
        assert!(!service.receive(&mut ctx, &inbound));
        assert_eq!(service.core.payloads_received, 0);
    }

    #[test]
    fn test_extra_requests_follow_kind() {
        let config = SimConfig::default();
        let db = Service::new(ServiceKind::from_type_tag("database-service").expect("known tag"), config.software);
        assert!(db.request_manager().contains("backup"));
        let dns = Service::new(ServiceKind::from_type_tag("dns-client").expect("known tag"), config.software);
        assert!(dns.request_manager().contains("lookup"));
        assert!(!dns.request_manager().contains("backup"));
        assert!(matches!(
            ServiceKind::from_type_tag("telnet"),
            Err(ConfigError::UnknownServiceType(_))
        ));
    }
}
