//! Per-node registry of installed software
//!
//! Owns every service and application on a node, maps (port, protocol) to
//! the software bound there, and fans inbound payloads out to the bound
//! owner plus anything passively listening on the port. After software has
//! run, [`SoftwareManager::dispatch_events`] delivers the events it raised to
//! the rest of the node's software.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::applications::{Application, ApplicationKind, ApplicationOperatingState};
use crate::config::{SoftwareConfig, SoftwareTimings};
use crate::error::ConfigError;
use crate::frame::{IpProtocol, Port};
use crate::services::{Arp, Icmp, Service, ServiceKind, ServiceOperatingState};
use crate::software::{InboundPayload, NodeContext};

/// Guard against event loops between software on one node
const MAX_EVENTS_PER_DISPATCH: usize = 1_000;

#[derive(Debug, Clone)]
pub struct SoftwareManager {
    services: BTreeMap<String, Service>,
    applications: BTreeMap<String, Application>,
    port_protocol_mapping: BTreeMap<(Port, IpProtocol), String>,
    timings: SoftwareTimings,
}

impl SoftwareManager {
    pub fn new(timings: SoftwareTimings) -> Self {
        Self {
            services: BTreeMap::new(),
            applications: BTreeMap::new(),
            port_protocol_mapping: BTreeMap::new(),
            timings,
        }
    }

    fn is_installed(&self, name: &str) -> bool {
        self.services.contains_key(name) || self.applications.contains_key(name)
    }

    /// Install software from a config entry, resolving its type tag
    pub fn install(&mut self, ctx: &mut NodeContext, config: &SoftwareConfig) -> Result<bool, ConfigError> {
        let tag = config.software_type.as_str();
        if ServiceKind::is_service_tag(tag) {
            let mut service = Service::new(ServiceKind::from_config(config)?, self.timings);
            service.core.listen_on_ports.extend(config.listen_on_ports.iter().copied());
            Ok(self.install_service(ctx, service))
        } else if ApplicationKind::is_application_tag(tag) {
            let mut application = Application::new(ApplicationKind::from_config(config)?, self.timings);
            application.core.listen_on_ports.extend(config.listen_on_ports.iter().copied());
            Ok(self.install_application(ctx, application))
        } else {
            Err(ConfigError::Invalid(format!("unknown software type '{}'", tag)))
        }
    }

    pub fn install_service(&mut self, ctx: &mut NodeContext, mut service: Service) -> bool {
        let name = service.name().to_string();
        if self.is_installed(&name) {
            ctx.sys_log.warning(format!("Cannot install {} as it is already installed", name));
            return false;
        }
        if let Some(port) = service.core.port {
            self.port_protocol_mapping.insert((port, service.core.protocol), name.clone());
        }
        service.install(ctx);
        if ctx.operational {
            service.start(ctx);
        }
        ctx.sys_log.info(format!("Installed {}", name));
        let needs_ftp_client = matches!(service.kind(), ServiceKind::DatabaseService(_));
        self.services.insert(name.clone(), service);

        if needs_ftp_client && !self.is_installed("ftp-client") {
            ctx.sys_log.info(format!("{}: Installing FTPClient to enable database backups", name));
            let ftp_client = Service::new(ServiceKind::FtpClient(Default::default()), self.timings);
            self.install_service(ctx, ftp_client);
        }
        true
    }

    pub fn install_application(&mut self, ctx: &mut NodeContext, mut application: Application) -> bool {
        let name = application.name().to_string();
        if self.is_installed(&name) {
            ctx.sys_log.warning(format!("Cannot install {} as it is already installed", name));
            return false;
        }
        if let Some(port) = application.core.port {
            self.port_protocol_mapping.insert((port, application.core.protocol), name.clone());
        }
        application.install(ctx);
        ctx.sys_log.info(format!("Installed {}", name));
        self.applications.insert(name, application);
        true
    }

    pub fn uninstall(&mut self, ctx: &mut NodeContext, name: &str) -> bool {
        let removed = self.services.remove(name).is_some() || self.applications.remove(name).is_some();
        if !removed {
            ctx.sys_log.error(format!("Cannot uninstall {} as it is not installed", name));
            return false;
        }
        self.port_protocol_mapping.retain(|_, owner| owner != name);
        ctx.sys_log.info(format!("Uninstalled {}", name));
        true
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.get(name)
    }

    pub fn application_mut(&mut self, name: &str) -> Option<&mut Application> {
        self.applications.get_mut(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values()
    }

    pub fn arp(&self) -> Option<&Arp> {
        match self.services.get("arp").map(Service::kind) {
            Some(ServiceKind::Arp(arp)) => Some(arp),
            _ => None,
        }
    }

    pub fn arp_mut(&mut self) -> Option<&mut Arp> {
        match self.services.get_mut("arp").map(Service::kind_mut) {
            Some(ServiceKind::Arp(arp)) => Some(arp),
            _ => None,
        }
    }

    pub fn icmp(&self) -> Option<&Icmp> {
        match self.services.get("icmp").map(Service::kind) {
            Some(ServiceKind::Icmp(icmp)) => Some(icmp),
            _ => None,
        }
    }

    pub fn icmp_mut(&mut self) -> Option<&mut Icmp> {
        match self.services.get_mut("icmp").map(Service::kind_mut) {
            Some(ServiceKind::Icmp(icmp)) => Some(icmp),
            _ => None,
        }
    }

    /// True if the named service exists and is running
    pub fn service_running(&self, name: &str) -> bool {
        self.services
            .get(name)
            .map_or(false, |service| service.operating_state() == ServiceOperatingState::Running)
    }

    /// Ports with running software bound to them
    pub fn get_open_ports(&self) -> Vec<Port> {
        let mut ports: Vec<Port> = self
            .port_protocol_mapping
            .iter()
            .filter(|(_, name)| self.is_running(name))
            .map(|((port, _), _)| *port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn check_port_is_open(&self, port: Port, protocol: IpProtocol) -> bool {
        self.port_protocol_mapping
            .get(&(port, protocol))
            .map_or(false, |name| self.is_running(name))
    }

    fn is_running(&self, name: &str) -> bool {
        if let Some(service) = self.services.get(name) {
            return service.operating_state() == ServiceOperatingState::Running;
        }
        self.applications
            .get(name)
            .map_or(false, |app| app.operating_state() == ApplicationOperatingState::Running)
    }

    /// Deliver an inbound payload to the bound owner, then to passive listeners
    pub fn receive_payload(&mut self, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let owner = self
            .port_protocol_mapping
            .get(&(inbound.dst_port, inbound.protocol))
            .cloned();
        let listeners: Vec<String> = self
            .services
            .values()
            .map(|service| &service.core)
            .chain(self.applications.values().map(|app| &app.core))
            .filter(|core| core.listen_on_ports.contains(&inbound.dst_port))
            .filter(|core| Some(&core.name) != owner.as_ref())
            .map(|core| core.name.clone())
            .collect();

        if owner.is_none() && listeners.is_empty() {
            ctx.sys_log.warning(format!(
                "No software bound to port {}/{}, dropping payload from {}",
                inbound.dst_port, inbound.protocol, inbound.src_ip_address
            ));
            return false;
        }

        let mut handled = false;
        for name in owner.iter().chain(listeners.iter()) {
            // each receiver gets its own copy
            let copy = inbound.clone();
            handled |= self.deliver(ctx, name, &copy);
        }
        self.dispatch_events(ctx);
        handled
    }

    fn deliver(&mut self, ctx: &mut NodeContext, name: &str, inbound: &InboundPayload) -> bool {
        if let Some(service) = self.services.get_mut(name) {
            return service.receive(ctx, inbound);
        }
        match self.applications.get_mut(name) {
            Some(application) => application.receive(ctx, inbound),
            None => false,
        }
    }

    /// Hand queued software events to every installed software, in name order
    pub fn dispatch_events(&mut self, ctx: &mut NodeContext) {
        let mut dispatched = 0;
        while let Some(event) = ctx.pop_event() {
            dispatched += 1;
            if dispatched > MAX_EVENTS_PER_DISPATCH {
                ctx.sys_log.error("Software event limit reached, dropping remaining events");
                while ctx.pop_event().is_some() {}
                return;
            }
            let mut served = false;
            for service in self.services.values_mut() {
                served |= service.on_event(ctx, &event);
            }
            for application in self.applications.values_mut() {
                served |= application.on_event(ctx, &event);
            }
            if !served {
                if let Some(reply) = event.unserved_reply() {
                    ctx.sys_log.debug(format!("No software on {} served {:?}", ctx.hostname, event));
                    ctx.emit(reply);
                }
            }
        }
    }

    /// Node finished booting: start services and open applications
    pub fn start_up(&mut self, ctx: &mut NodeContext) {
        for service in self.services.values_mut() {
            service.start(ctx);
        }
        for application in self.applications.values_mut() {
            application.run(ctx);
        }
    }

    /// Node finished shutting down
    pub fn shut_down(&mut self, ctx: &mut NodeContext) {
        for service in self.services.values_mut() {
            service.stop(ctx);
        }
        for application in self.applications.values_mut() {
            application.close(ctx);
        }
    }

    pub fn scan_all(&mut self, ctx: &mut NodeContext) {
        for service in self.services.values_mut() {
            service.core.scan(&mut ctx.sys_log);
        }
        for application in self.applications.values_mut() {
            application.core.scan(&mut ctx.sys_log);
        }
    }

    /// Let software expire round trips the network never answered
    pub fn network_idle(&mut self, ctx: &mut NodeContext) {
        for service in self.services.values_mut() {
            service.network_idle(ctx);
        }
        for application in self.applications.values_mut() {
            application.network_idle(ctx);
        }
        self.dispatch_events(ctx);
    }

    pub fn apply_timestep(&mut self, ctx: &mut NodeContext) {
        for service in self.services.values_mut() {
            service.apply_timestep(ctx);
        }
        for application in self.applications.values_mut() {
            application.apply_timestep(ctx);
        }
        self.dispatch_events(ctx);
    }

    pub fn describe_state(&self) -> Value {
        let services: Map<String, Value> = self
            .services
            .iter()
            .map(|(name, service)| (name.clone(), service.describe_state()))
            .collect();
        let applications: Map<String, Value> = self
            .applications
            .iter()
            .map(|(name, application)| (name.clone(), application.describe_state()))
            .collect();
        json!({
            "services": services,
            "applications": applications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::{HTTP_PORT, POSTGRES_PORT};
    use crate::protocols::{DatabasePacket, Payload};
    use std::net::Ipv4Addr;

    fn running_context(hostname: &str) -> (SoftwareManager, NodeContext) {
        let config = SimConfig::default();
        let mut ctx = NodeContext::new(hostname, &config);
        ctx.operational = true;
        (SoftwareManager::new(config.software), ctx)
    }

    #[test]
    fn test_database_service_pulls_in_ftp_client() {
        let (mut manager, mut ctx) = running_context("database_server");
        assert_eq!(manager.install(&mut ctx, &SoftwareConfig::new("database-service")), Ok(true));
        assert!(manager.service("ftp-client").is_some());
        assert!(ctx.file_system.get_file("database", "database.db").is_some());
        assert_eq!(manager.install(&mut ctx, &SoftwareConfig::new("database-service")), Ok(false));
        assert_eq!(manager.get_open_ports(), vec![21, POSTGRES_PORT]);
    }

    #[test]
    fn test_payload_fans_out_to_passive_listeners() {
        let (mut manager, mut ctx) = running_context("database_server");
        manager
            .install(&mut ctx, &SoftwareConfig::new("database-service"))
            .expect("known type");
        let mut listener = SoftwareConfig::new("web-server");
        listener.listen_on_ports = vec![POSTGRES_PORT];
        manager.install(&mut ctx, &listener).expect("known type");

        let inbound = InboundPayload {
            payload: Payload::Database(DatabasePacket::ConnectRequest {
                connection_request_id: 1,
                password: None,
            }),
            src_ip_address: Ipv4Addr::new(192, 168, 1, 12),
            src_port: POSTGRES_PORT,
            dst_port: POSTGRES_PORT,
            protocol: IpProtocol::Tcp,
        };
        assert!(manager.receive_payload(&mut ctx, &inbound));
        let received = |name: &str| manager.service(name).map(|service| service.core.payloads_received);
        assert_eq!(received("database-service"), Some(1));
        assert_eq!(received("web-server"), Some(1));
    }

    #[test]
    fn test_closed_application_port_is_not_open() {
        let (mut manager, mut ctx) = running_context("client_1");
        manager.install(&mut ctx, &SoftwareConfig::new("web-browser")).expect("known type");
        assert!(!manager.check_port_is_open(HTTP_PORT, IpProtocol::Tcp));
        if let Some(app) = manager.application_mut("web-browser") {
            app.run(&mut ctx);
        }
        assert!(manager.check_port_is_open(HTTP_PORT, IpProtocol::Tcp));
    }

    #[test]
    fn test_unserved_query_fails_back_to_requester() {
        let (mut manager, mut ctx) = running_context("web_server");
        manager.install(&mut ctx, &SoftwareConfig::new("web-server")).expect("known type");
        let inbound = InboundPayload {
            payload: Payload::Http(crate::protocols::HttpPacket::Request {
                method: crate::protocols::HttpMethod::Get,
                url: "http://arcd.com/users/".to_string(),
                request_id: 3,
            }),
            src_ip_address: Ipv4Addr::new(192, 168, 10, 21),
            src_port: HTTP_PORT,
            dst_port: HTTP_PORT,
            protocol: IpProtocol::Tcp,
        };
        manager.receive_payload(&mut ctx, &inbound);
        // no database client on the node, so the page fails straight away
        let sent = ctx.take_outbound();
        assert_eq!(
            sent[0].payload,
            Payload::Http(crate::protocols::HttpPacket::Response {
                status_code: 404,
                request_id: 3
            })
        );
    }
}
