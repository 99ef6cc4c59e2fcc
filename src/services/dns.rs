//! Domain name resolution
//!
//! The server answers queries from a static domain mapping. The client keeps
//! a cache; lookups that miss it go to the configured server (or the node's
//! default DNS server) and complete when the reply arrives.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::frame::DNS_PORT;
use crate::protocols::{DnsPacket, Payload};
use crate::software::{
    InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent, SoftwareOptions,
};

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DnsClient {
    /// Overrides the node's DNS server when set
    pub dns_server: Option<Ipv4Addr>,
    cache: BTreeMap<String, Ipv4Addr>,
    awaiting: BTreeSet<String>,
}

impl DnsClient {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            dns_server: options.ip("dns_server")?,
            ..Self::default()
        })
    }

    pub fn cached(&self, domain_name: &str) -> Option<Ipv4Addr> {
        self.cache.get(domain_name).copied()
    }

    pub fn add_domain_to_cache(&mut self, domain_name: &str, ip_address: Ipv4Addr) {
        self.cache.insert(domain_name.to_string(), ip_address);
    }

    /// Resolve `domain_name`, answering from cache or querying the server.
    ///
    /// Emits `DomainResolved` immediately on a cache hit or when no server is
    /// known; otherwise once the reply arrives. False if nothing was sent.
    pub fn lookup(&mut self, core: &SoftwareCore, ctx: &mut NodeContext, domain_name: &str) -> bool {
        if let Some(ip_address) = self.cached(domain_name) {
            ctx.emit(SoftwareEvent::DomainResolved {
                domain_name: domain_name.to_string(),
                ip_address: Some(ip_address),
            });
            return true;
        }
        let Some(server) = self.dns_server.or(ctx.dns_server) else {
            ctx.sys_log.warning(format!("{}: no DNS server configured, cannot resolve {}", core.name, domain_name));
            ctx.emit(SoftwareEvent::DomainResolved {
                domain_name: domain_name.to_string(),
                ip_address: None,
            });
            return false;
        };
        ctx.sys_log.info(format!("{}: resolving {} via {}", core.name, domain_name, server));
        self.awaiting.insert(domain_name.to_string());
        ctx.send(OutboundPayload::tcp(
            Payload::Dns(DnsPacket::Query {
                domain_name: domain_name.to_string(),
            }),
            server,
            DNS_PORT,
        ));
        true
    }
}

impl SoftwareBehaviour for DnsClient {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Dns(DnsPacket::Reply { domain_name, ip_address }) = &inbound.payload else {
            return false;
        };
        if !self.awaiting.remove(domain_name) {
            ctx.sys_log.debug(format!("{}: unsolicited reply for {}", core.name, domain_name));
            return false;
        }
        match ip_address {
            Some(ip_address) => {
                ctx.sys_log.info(format!("{}: resolved {} to {}", core.name, domain_name, ip_address));
                self.add_domain_to_cache(domain_name, *ip_address);
            }
            None => ctx.sys_log.warning(format!("{}: {} could not be resolved", core.name, domain_name)),
        }
        ctx.emit(SoftwareEvent::DomainResolved {
            domain_name: domain_name.clone(),
            ip_address: *ip_address,
        });
        true
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        match event {
            SoftwareEvent::DomainLookupRequested { domain_name, .. } => {
                self.lookup(core, ctx, domain_name);
                true
            }
            _ => false,
        }
    }

    fn on_network_idle(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext) {
        for domain_name in std::mem::take(&mut self.awaiting) {
            ctx.sys_log.warning(format!("{}: no reply resolving {}", core.name, domain_name));
            ctx.emit(SoftwareEvent::DomainResolved {
                domain_name,
                ip_address: None,
            });
        }
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        let cache: Map<String, Value> = self
            .cache
            .iter()
            .map(|(domain, ip)| (domain.clone(), Value::from(ip.to_string())))
            .collect();
        state.insert("dns_cache".to_string(), Value::Object(cache));
    }
}

// ============================================================================
// SERVER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DnsServer {
    domain_mapping: BTreeMap<String, Ipv4Addr>,
}

impl DnsServer {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        let mut server = Self::default();
        if let Some(mapping) = options.object("domain_mapping")? {
            for (domain_name, ip) in mapping {
                let ip_address = ip
                    .as_str()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| ConfigError::Invalid(format!("dns-server: bad address for {}", domain_name)))?;
                server.dns_register(domain_name, ip_address);
            }
        }
        Ok(server)
    }

    pub fn dns_register(&mut self, domain_name: &str, ip_address: Ipv4Addr) {
        self.domain_mapping.insert(domain_name.to_string(), ip_address);
    }

    pub fn dns_lookup(&self, domain_name: &str) -> Option<Ipv4Addr> {
        self.domain_mapping.get(domain_name).copied()
    }
}

impl SoftwareBehaviour for DnsServer {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Dns(DnsPacket::Query { domain_name }) = &inbound.payload else {
            return false;
        };
        let ip_address = self.dns_lookup(domain_name);
        ctx.sys_log.info(format!(
            "{}: query for {} from {} answered with {:?}",
            core.name, domain_name, inbound.src_ip_address, ip_address
        ));
        ctx.send(OutboundPayload::reply_to(
            inbound,
            Payload::Dns(DnsPacket::Reply {
                domain_name: domain_name.clone(),
                ip_address,
            }),
        ));
        true
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("num_domains".to_string(), Value::from(self.domain_mapping.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::frame::IpProtocol;

    fn context(hostname: &str) -> NodeContext {
        let mut ctx = NodeContext::new(hostname, &SimConfig::default());
        ctx.operational = true;
        ctx
    }

    #[test]
    fn test_server_answers_known_and_unknown_domains() {
        let options = serde_json::json!({"domain_mapping": {"arcd.com": "192.168.1.12"}});
        let options = options.as_object().cloned().unwrap_or_default();
        let mut server = DnsServer::from_options(&SoftwareOptions::new("dns-server", &options)).expect("valid");
        let mut core = SoftwareCore::new("dns-server", Some(DNS_PORT), IpProtocol::Tcp, 2);
        let mut ctx = context("domain_controller");

        let query = InboundPayload {
            payload: Payload::Dns(DnsPacket::Query {
                domain_name: "arcd.com".to_string(),
            }),
            src_ip_address: Ipv4Addr::new(192, 168, 10, 21),
            src_port: DNS_PORT,
            dst_port: DNS_PORT,
            protocol: IpProtocol::Tcp,
        };
        assert!(server.receive(&mut core, &mut ctx, &query));
        let sent = ctx.take_outbound();
        assert_eq!(sent[0].dst_ip_address, Ipv4Addr::new(192, 168, 10, 21));
        assert_eq!(
            sent[0].payload,
            Payload::Dns(DnsPacket::Reply {
                domain_name: "arcd.com".to_string(),
                ip_address: Some(Ipv4Addr::new(192, 168, 1, 12)),
            })
        );
    }

    #[test]
    fn test_client_without_server_fails_immediately() {
        let mut client = DnsClient::default();
        let core = SoftwareCore::new("dns-client", Some(DNS_PORT), IpProtocol::Tcp, 2);
        let mut ctx = context("client_1");

        assert!(!client.lookup(&core, &mut ctx, "arcd.com"));
        assert_eq!(
            ctx.pop_event(),
            Some(SoftwareEvent::DomainResolved {
                domain_name: "arcd.com".to_string(),
                ip_address: None,
            })
        );
        assert!(ctx.take_outbound().is_empty());
    }

    #[test]
    fn test_client_caches_reply() {
        let mut client = DnsClient::default();
        let mut core = SoftwareCore::new("dns-client", Some(DNS_PORT), IpProtocol::Tcp, 2);
        let mut ctx = context("client_1");
        ctx.dns_server = Some(Ipv4Addr::new(192, 168, 1, 10));

        assert!(client.lookup(&core, &mut ctx, "arcd.com"));
        assert_eq!(ctx.take_outbound()[0].dst_ip_address, Ipv4Addr::new(192, 168, 1, 10));

        let reply = InboundPayload {
            payload: Payload::Dns(DnsPacket::Reply {
                domain_name: "arcd.com".to_string(),
                ip_address: Some(Ipv4Addr::new(192, 168, 1, 12)),
            }),
            src_ip_address: Ipv4Addr::new(192, 168, 1, 10),
            src_port: DNS_PORT,
            dst_port: DNS_PORT,
            protocol: IpProtocol::Tcp,
        };
        assert!(client.receive(&mut core, &mut ctx, &reply));
        assert_eq!(client.cached("arcd.com"), Some(Ipv4Addr::new(192, 168, 1, 12)));
        // a repeated reply is no longer expected
        assert!(!client.receive(&mut core, &mut ctx, &reply));
    }

    #[test]
    fn test_lookup_without_reply_resolves_to_nothing_once_idle() {
        let mut client = DnsClient {
            dns_server: Some(Ipv4Addr::new(192, 168, 1, 10)),
            ..DnsClient::default()
        };
        let mut core = SoftwareCore::new("dns-client", Some(DNS_PORT), IpProtocol::Tcp, 2);
        let mut ctx = context("client_1");

        assert!(client.lookup(&core, &mut ctx, "arcd.com"));
        assert_eq!(ctx.take_outbound().len(), 1);
        client.on_network_idle(&mut core, &mut ctx);
        assert_eq!(
            ctx.pop_event(),
            Some(SoftwareEvent::DomainResolved {
                domain_name: "arcd.com".to_string(),
                ip_address: None,
            })
        );
        client.on_network_idle(&mut core, &mut ctx);
        assert_eq!(ctx.pop_event(), None);
    }
}
