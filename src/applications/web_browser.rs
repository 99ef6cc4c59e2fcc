//! Web browser
//!
//! Fetches its target URL on `execute`. Host names are resolved through the
//! node's DNS client first. Every attempt is kept in the history with its
//! eventual outcome.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::ExecuteOutcome;
use crate::error::ConfigError;
use crate::frame::HTTP_PORT;
use crate::protocols::{split_url, HttpMethod, HttpPacket, Payload, HTTP_OK};
use crate::software::{
    InboundPayload, NodeContext, OutboundPayload, SoftwareBehaviour, SoftwareCore, SoftwareEvent, SoftwareOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserOutcome {
    Pending,
    /// A response arrived with this status code
    Response(u16),
    DomainUnresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserHistoryItem {
    pub url: String,
    pub request_id: u64,
    pub outcome: BrowserOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct WebBrowser {
    pub target_url: Option<String>,
    history: Vec<BrowserHistoryItem>,
    /// domain -> request ids waiting on its resolution
    awaiting_domain: BTreeMap<String, Vec<u64>>,
}

impl WebBrowser {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            target_url: options.string("target_url")?,
            ..Self::default()
        })
    }

    pub fn history(&self) -> &[BrowserHistoryItem] {
        &self.history
    }

    pub fn last_page_loaded(&self) -> bool {
        self.history
            .last()
            .map_or(false, |item| item.outcome == BrowserOutcome::Response(HTTP_OK))
    }

    /// Status code of the most recent answered request
    pub fn latest_response_code(&self) -> Option<u16> {
        self.history.iter().rev().find_map(|item| match item.outcome {
            BrowserOutcome::Response(code) => Some(code),
            _ => None,
        })
    }

    pub fn get_webpage(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> ExecuteOutcome {
        let Some(url) = self.target_url.clone() else {
            ctx.sys_log.warning(format!("{}: no target URL configured", core.name));
            return ExecuteOutcome::Completed(false);
        };
        let request_id = ctx.next_id();
        self.history.push(BrowserHistoryItem {
            url: url.clone(),
            request_id,
            outcome: BrowserOutcome::Pending,
        });

        let (host, _) = split_url(&url);
        match host.parse::<Ipv4Addr>() {
            Ok(ip_address) => self.send_get(ctx, request_id, &url, ip_address),
            Err(_) => {
                self.awaiting_domain.entry(host.clone()).or_default().push(request_id);
                ctx.emit(SoftwareEvent::DomainLookupRequested {
                    requester: core.name.clone(),
                    domain_name: host,
                });
            }
        }
        ExecuteOutcome::Pending
    }

    fn send_get(&mut self, ctx: &mut NodeContext, request_id: u64, url: &str, ip_address: Ipv4Addr) {
        ctx.send(OutboundPayload::tcp(
            Payload::Http(HttpPacket::Request {
                method: HttpMethod::Get,
                url: url.to_string(),
                request_id,
            }),
            ip_address,
            HTTP_PORT,
        ));
    }

    fn set_outcome(&mut self, request_id: u64, outcome: BrowserOutcome) {
        if let Some(item) = self.history.iter_mut().find(|item| item.request_id == request_id) {
            item.outcome = outcome;
        }
    }
}

impl SoftwareBehaviour for WebBrowser {
    fn receive(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        let Payload::Http(HttpPacket::Response { status_code, request_id }) = inbound.payload else {
            return false;
        };
        ctx.sys_log.info(format!("{}: received HTTP {} for request {}", core.name, status_code, request_id));
        self.set_outcome(request_id, BrowserOutcome::Response(status_code));
        true
    }

    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        let SoftwareEvent::DomainResolved { domain_name, ip_address } = event else {
            return false;
        };
        let Some(request_ids) = self.awaiting_domain.remove(domain_name) else {
            return false;
        };
        for request_id in request_ids {
            match ip_address {
                Some(ip_address) => {
                    let url = self
                        .history
                        .iter()
                        .find(|item| item.request_id == request_id)
                        .map(|item| item.url.clone());
                    if let Some(url) = url {
                        self.send_get(ctx, request_id, &url, *ip_address);
                    }
                }
                None => {
                    ctx.sys_log.warning(format!("{}: unable to resolve {}", core.name, domain_name));
                    self.set_outcome(request_id, BrowserOutcome::DomainUnresolved);
                }
            }
        }
        false
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        let history: Vec<Value> = self
            .history
            .iter()
            .map(|item| {
                let outcome = match item.outcome {
                    BrowserOutcome::Pending => json!("PENDING"),
                    BrowserOutcome::Response(code) => json!(code),
                    BrowserOutcome::DomainUnresolved => json!("DOMAIN_UNRESOLVED"),
                };
                json!({"url": item.url, "outcome": outcome})
            })
            .collect();
        state.insert("history".to_string(), Value::Array(history));
    }
}
