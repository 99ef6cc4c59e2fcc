//! Access control lists
//!
//! Rules are keyed by position and evaluated lowest position first. The first
//! matching rule decides; if nothing matches the list's implicit action
//! applies. An unset field matches anything on that dimension, and a wildcard
//! mask bit of 1 means "ignore this address bit".

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{AclRuleConfig, PortSpec};
use crate::error::{ConfigError, RequestError};
use crate::frame::{port_from_name, Frame, IpProtocol, Port};
use crate::request::{
    arg_parse, arg_str, expect_args, RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken,
    RequestType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AclAction {
    Permit,
    Deny,
}

impl AclAction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PERMIT" | "ALLOW" => Some(AclAction::Permit),
            "DENY" | "BLOCK" => Some(AclAction::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclAction::Permit => write!(f, "PERMIT"),
            AclAction::Deny => write!(f, "DENY"),
        }
    }
}

/// Tokens that mean "match anything" in rule fields
fn is_any(token: &str) -> bool {
    matches!(token.to_ascii_uppercase().as_str(), "ALL" | "ANY" | "NONE" | "")
}

fn wildcard_match(address: Ipv4Addr, rule_address: Ipv4Addr, wildcard_mask: Option<Ipv4Addr>) -> bool {
    let ignore = wildcard_mask.map_or(0, u32::from);
    (u32::from(address) & !ignore) == (u32::from(rule_address) & !ignore)
}

// ============================================================================
// RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclRule {
    pub action: AclAction,
    pub protocol: Option<IpProtocol>,
    pub src_ip_address: Option<Ipv4Addr>,
    pub src_wildcard_mask: Option<Ipv4Addr>,
    pub dst_ip_address: Option<Ipv4Addr>,
    pub dst_wildcard_mask: Option<Ipv4Addr>,
    pub src_port: Option<Port>,
    pub dst_port: Option<Port>,
    /// Frames this rule has decided
    pub match_count: u64,
}

impl AclRule {
    pub fn new(action: AclAction) -> Self {
        Self {
            action,
            protocol: None,
            src_ip_address: None,
            src_wildcard_mask: None,
            dst_ip_address: None,
            dst_wildcard_mask: None,
            src_port: None,
            dst_port: None,
            match_count: 0,
        }
    }

    pub fn permit() -> Self {
        Self::new(AclAction::Permit)
    }

    pub fn deny() -> Self {
        Self::new(AclAction::Deny)
    }

    pub fn protocol(mut self, protocol: IpProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn src_ip(mut self, address: Ipv4Addr, wildcard_mask: Option<Ipv4Addr>) -> Self {
        self.src_ip_address = Some(address);
        self.src_wildcard_mask = wildcard_mask;
        self
    }

    pub fn dst_ip(mut self, address: Ipv4Addr, wildcard_mask: Option<Ipv4Addr>) -> Self {
        self.dst_ip_address = Some(address);
        self.dst_wildcard_mask = wildcard_mask;
        self
    }

    pub fn src_port(mut self, port: Port) -> Self {
        self.src_port = Some(port);
        self
    }

    pub fn dst_port(mut self, port: Port) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn from_config(config: &AclRuleConfig) -> Result<Self, ConfigError> {
        let action = AclAction::from_name(&config.action)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown ACL action '{}'", config.action)))?;
        let protocol = match config.protocol.as_deref() {
            Some(name) if !is_any(name) => Some(
                IpProtocol::from_name(name)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown protocol '{}'", name)))?,
            ),
            _ => None,
        };
        let port = |spec: &Option<PortSpec>| -> Result<Option<Port>, ConfigError> {
            match spec {
                None => Ok(None),
                Some(PortSpec::Number(number)) => Ok(Some(*number)),
                Some(PortSpec::Name(name)) if is_any(name) => Ok(None),
                Some(PortSpec::Name(name)) => port_from_name(name)
                    .map(Some)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown port '{}'", name))),
            }
        };
        Ok(Self {
            action,
            protocol,
            src_ip_address: config.src_ip,
            src_wildcard_mask: config.src_wildcard_mask,
            dst_ip_address: config.dst_ip,
            dst_wildcard_mask: config.dst_wildcard_mask,
            src_port: port(&config.src_port)?,
            dst_port: port(&config.dst_port)?,
            match_count: 0,
        })
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        let ip = frame.ip();
        if self.protocol.map_or(false, |protocol| protocol != ip.protocol) {
            return false;
        }
        if let Some(address) = self.src_ip_address {
            if !wildcard_match(ip.src_ip_address, address, self.src_wildcard_mask) {
                return false;
            }
        }
        if let Some(address) = self.dst_ip_address {
            if !wildcard_match(ip.dst_ip_address, address, self.dst_wildcard_mask) {
                return false;
            }
        }
        if self.src_port.is_some() && self.src_port != frame.src_port() {
            return false;
        }
        if self.dst_port.is_some() && self.dst_port != frame.dst_port() {
            return false;
        }
        true
    }
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn any<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "ANY".to_string(), |value| value.to_string())
        }
        write!(
            f,
            "{} {} {} -> {} port {} -> {}",
            self.action,
            any(self.protocol),
            any(self.src_ip_address),
            any(self.dst_ip_address),
            any(self.src_port),
            any(self.dst_port)
        )
    }
}

// ============================================================================
// ACCESS CONTROL LIST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclDecision {
    pub permitted: bool,
    /// None when the implicit action decided
    pub rule_position: Option<usize>,
}

impl fmt::Display for AclDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule_position {
            Some(position) => write!(f, "{}", position),
            None => write!(f, "implicit"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessControlList {
    pub name: String,
    pub implicit_action: AclAction,
    pub max_acl_rules: usize,
    rules: BTreeMap<usize, AclRule>,
    request_manager: RequestManager<AccessControlList>,
}

impl AccessControlList {
    pub fn new(name: &str, implicit_action: AclAction, max_acl_rules: usize) -> Self {
        Self {
            name: name.to_string(),
            implicit_action,
            max_acl_rules,
            rules: BTreeMap::new(),
            request_manager: acl_request_manager(),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = (usize, &AclRule)> {
        self.rules.iter().map(|(position, rule)| (*position, rule))
    }

    pub fn get_rule(&self, position: usize) -> Option<&AclRule> {
        self.rules.get(&position)
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Place a rule at `position`, replacing whatever was there.
    pub fn add_rule(&mut self, position: usize, rule: AclRule) -> bool {
        if position >= self.max_acl_rules {
            log::warn!(
                "{}: cannot add rule at position {} (maximum {})",
                self.name,
                position,
                self.max_acl_rules
            );
            return false;
        }
        log::info!("{}: added rule {} at position {}", self.name, rule, position);
        self.rules.insert(position, rule);
        true
    }

    pub fn remove_rule(&mut self, position: usize) -> bool {
        match self.rules.remove(&position) {
            Some(rule) => {
                log::info!("{}: removed rule {} at position {}", self.name, rule, position);
                true
            }
            None => {
                log::warn!("{}: no rule at position {} to remove", self.name, position);
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// First matching rule by position, without recording the match
    pub fn evaluate(&self, frame: &Frame) -> AclDecision {
        for (position, rule) in &self.rules {
            if rule.matches(frame) {
                return AclDecision {
                    permitted: rule.action == AclAction::Permit,
                    rule_position: Some(*position),
                };
            }
        }
        AclDecision {
            permitted: self.implicit_action == AclAction::Permit,
            rule_position: None,
        }
    }

    pub fn is_permitted(&mut self, frame: &Frame) -> AclDecision {
        let decision = self.evaluate(frame);
        if let Some(rule) = decision.rule_position.and_then(|position| self.rules.get_mut(&position)) {
            rule.match_count += 1;
        }
        decision
    }

    pub fn describe_state(&self) -> Value {
        let rules: serde_json::Map<String, Value> = self
            .rules
            .iter()
            .map(|(position, rule)| (position.to_string(), json!(rule)))
            .collect();
        json!({
            "name": self.name,
            "implicit_action": self.implicit_action,
            "max_acl_rules": self.max_acl_rules,
            "rules": rules,
        })
    }
}

impl RequestHandler for AccessControlList {
    fn request_manager(&self) -> &RequestManager<Self> {
        &self.request_manager
    }
}

fn parse_optional<T>(
    request: &[RequestToken],
    index: usize,
    argument: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, RequestError> {
    let raw = arg_str(request, index, "add_rule", argument)?;
    if is_any(&raw) {
        return Ok(None);
    }
    parse(&raw)
        .map(Some)
        .ok_or(RequestError::InvalidArgument { field: argument, value: raw })
}

fn acl_request_manager() -> RequestManager<AccessControlList> {
    // [permission, protocol, src_ip, src_wildcard, src_port, dst_ip, dst_wildcard, dst_port, position]
    fn add_rule(acl: &mut AccessControlList, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 9, "add_rule")?;
        let action_name = arg_str(request, 0, "add_rule", "permission")?;
        let action = AclAction::from_name(&action_name).ok_or(RequestError::InvalidArgument {
            field: "permission",
            value: action_name,
        })?;
        let rule = AclRule {
            action,
            protocol: parse_optional(request, 1, "protocol", IpProtocol::from_name)?,
            src_ip_address: parse_optional(request, 2, "src_ip", |raw| raw.parse().ok())?,
            src_wildcard_mask: parse_optional(request, 3, "src_wildcard", |raw| raw.parse().ok())?,
            src_port: parse_optional(request, 4, "src_port", port_from_name)?,
            dst_ip_address: parse_optional(request, 5, "dst_ip", |raw| raw.parse().ok())?,
            dst_wildcard_mask: parse_optional(request, 6, "dst_wildcard", |raw| raw.parse().ok())?,
            dst_port: parse_optional(request, 7, "dst_port", port_from_name)?,
            match_count: 0,
        };
        let position: usize = arg_parse(request, 8, "add_rule", "position")?;
        Ok(RequestResponse::from_bool(acl.add_rule(position, rule)))
    }

    fn remove_rule(acl: &mut AccessControlList, _: &mut (), request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "remove_rule")?;
        let position: usize = arg_parse(request, 0, "remove_rule", "position")?;
        Ok(RequestResponse::from_bool(acl.remove_rule(position)))
    }

    RequestManager::new()
        .with("add_rule", RequestType::new(add_rule))
        .with("remove_rule", RequestType::new(remove_rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, IcmpPacket, IcmpType, MacAddress, HTTP_PORT};
    use crate::request;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], dst_port: Port) -> Frame {
        FrameBuilder::new(
            MacAddress::derived("a", 1),
            MacAddress::derived("b", 1),
            Ipv4Addr::from(src),
            Ipv4Addr::from(dst),
            IpProtocol::Tcp,
            64,
        )
        .tcp(49152, dst_port)
        .build()
        .expect("valid frame")
    }

    fn icmp_frame(src: [u8; 4], dst: [u8; 4]) -> Frame {
        FrameBuilder::new(
            MacAddress::derived("a", 1),
            MacAddress::derived("b", 1),
            Ipv4Addr::from(src),
            Ipv4Addr::from(dst),
            IpProtocol::Icmp,
            64,
        )
        .icmp(IcmpPacket {
            icmp_type: IcmpType::EchoRequest,
            identifier: 1,
            sequence: 0,
        })
        .build()
        .expect("valid frame")
    }

    #[test]
    fn test_lowest_position_wins() {
        let mut acl = AccessControlList::new("test", AclAction::Deny, 25);
        acl.add_rule(5, AclRule::permit().protocol(IpProtocol::Tcp));
        acl.add_rule(2, AclRule::deny().dst_port(HTTP_PORT));

        let decision = acl.is_permitted(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], HTTP_PORT));
        assert!(!decision.permitted);
        assert_eq!(decision.rule_position, Some(2));

        let decision = acl.is_permitted(&tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 22));
        assert!(decision.permitted);
        assert_eq!(decision.rule_position, Some(5));
        assert_eq!(acl.get_rule(5).expect("rule").match_count, 1);
    }

    #[test]
    fn test_implicit_action_when_nothing_matches() {
        let mut acl = AccessControlList::new("test", AclAction::Deny, 25);
        acl.add_rule(1, AclRule::permit().protocol(IpProtocol::Udp));
        let decision = acl.evaluate(&icmp_frame([10, 0, 0, 1], [10, 0, 0, 2]));
        assert_eq!(
            decision,
            AclDecision {
                permitted: false,
                rule_position: None
            }
        );

        let open = AccessControlList::new("open", AclAction::Permit, 25);
        assert!(open.evaluate(&icmp_frame([10, 0, 0, 1], [10, 0, 0, 2])).permitted);
    }

    #[test]
    fn test_wildcard_masks_ignore_set_bits() {
        let mut acl = AccessControlList::new("test", AclAction::Permit, 25);
        acl.add_rule(
            1,
            AclRule::deny().src_ip(Ipv4Addr::new(192, 168, 10, 0), Some(Ipv4Addr::new(0, 0, 0, 255))),
        );
        assert!(!acl.evaluate(&icmp_frame([192, 168, 10, 77], [192, 168, 1, 1])).permitted);
        assert!(acl.evaluate(&icmp_frame([192, 168, 11, 77], [192, 168, 1, 1])).permitted);

        // all-ones wildcard matches every address
        acl.add_rule(
            0,
            AclRule::permit().dst_ip(Ipv4Addr::new(1, 2, 3, 4), Some(Ipv4Addr::new(255, 255, 255, 255))),
        );
        assert!(acl.evaluate(&icmp_frame([192, 168, 10, 77], [8, 8, 8, 8])).permitted);
    }

    #[test]
    fn test_port_rules_do_not_match_icmp() {
        let mut acl = AccessControlList::new("test", AclAction::Permit, 25);
        acl.add_rule(1, AclRule::deny().dst_port(HTTP_PORT));
        assert!(acl.evaluate(&icmp_frame([10, 0, 0, 1], [10, 0, 0, 2])).permitted);
    }

    #[test]
    fn test_positions_beyond_limit_are_refused() {
        let mut acl = AccessControlList::new("test", AclAction::Deny, 3);
        assert!(!acl.add_rule(3, AclRule::permit()));
        assert!(acl.add_rule(2, AclRule::permit()));
        assert!(acl.add_rule(2, AclRule::deny()));
        assert_eq!(acl.num_rules(), 1);
        assert_eq!(acl.get_rule(2).expect("rule").action, AclAction::Deny);
    }

    #[test]
    fn test_add_and_remove_rule_requests() {
        let mut acl = AccessControlList::new("test", AclAction::Permit, 25);
        let context = RequestContext::new(0);
        let response = acl
            .handle_request(
                &mut (),
                &request!["add_rule", "DENY", "ICMP", "192.168.10.21", "0.0.0.0", "ALL", "192.168.1.12", "NONE", "ALL", 4],
                &context,
            )
            .expect("well formed");
        assert!(response.is_success());
        assert!(!acl.evaluate(&icmp_frame([192, 168, 10, 21], [192, 168, 1, 12])).permitted);
        assert!(acl.evaluate(&icmp_frame([192, 168, 10, 21], [192, 168, 1, 14])).permitted);

        let response = acl
            .handle_request(&mut (), &request!["remove_rule", 4], &context)
            .expect("well formed");
        assert!(response.is_success());
        assert_eq!(acl.num_rules(), 0);

        let malformed = acl.handle_request(&mut (), &request!["add_rule", "DENY", "ICMP"], &context);
        assert!(malformed.is_err());
        let bad_protocol = acl.handle_request(
            &mut (),
            &request!["add_rule", "DENY", "SCTP", "ALL", "ALL", "ALL", "ALL", "ALL", "ALL", 1],
            &context,
        );
        assert!(matches!(bad_protocol, Err(RequestError::InvalidArgument { field: "protocol", .. })));
    }

    #[test]
    fn test_rule_from_config_resolves_port_names() {
        let config = AclRuleConfig {
            action: "PERMIT".to_string(),
            protocol: Some("TCP".to_string()),
            src_ip: None,
            src_wildcard_mask: None,
            dst_ip: None,
            dst_wildcard_mask: None,
            src_port: Some(PortSpec::Name("POSTGRES_SERVER".to_string())),
            dst_port: Some(PortSpec::Name("ALL".to_string())),
        };
        let rule = AclRule::from_config(&config).expect("valid rule");
        assert_eq!(rule.src_port, Some(5432));
        assert_eq!(rule.dst_port, None);
        assert_eq!(rule.protocol, Some(IpProtocol::Tcp));
    }
}
