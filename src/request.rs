//! Hierarchical request dispatch
//!
//! A request is a flat list of tokens such as
//! `["network", "node", "client_1", "service", "dns-client", "restart"]`.
//! Each stateful component owns a [`RequestManager`] mapping its first token
//! to a [`RequestType`]: either a terminal handler or a route that resolves a
//! child (node, software, folder...) and hands it the remaining tokens.
//!
//! Handlers receive the component itself plus an environment `E` holding the
//! resources the component shares with its owner (the node's syslog and file
//! system for software, the syslog for file-system items, `()` elsewhere).
//!
//! Expected failures (missing target, disallowed action) come back as
//! [`RequestResponse`]s. Only requests that cannot be routed or parsed
//! produce a [`RequestError`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::RequestError;

pub type RequestToken = Value;
pub type Request = Vec<RequestToken>;

/// Build a request from a list of string/number tokens.
#[macro_export]
macro_rules! request {
    ($($token:expr),* $(,)?) => {
        vec![$(::serde_json::Value::from($token)),*]
    };
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failure,
    Unreachable,
    /// Outcome depends on traffic that has not been delivered yet
    Pending,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Success => write!(f, "success"),
            RequestStatus::Failure => write!(f, "failure"),
            RequestStatus::Unreachable => write!(f, "unreachable"),
            RequestStatus::Pending => write!(f, "pending"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResponse {
    pub status: RequestStatus,
    pub data: Map<String, Value>,
}

impl RequestResponse {
    pub fn new(status: RequestStatus) -> Self {
        Self {
            status,
            data: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(RequestStatus::Success)
    }

    pub fn failure() -> Self {
        Self::new(RequestStatus::Failure)
    }

    pub fn unreachable() -> Self {
        Self::new(RequestStatus::Unreachable)
    }

    pub fn pending() -> Self {
        Self::new(RequestStatus::Pending)
    }

    pub fn from_bool(ok: bool) -> Self {
        if ok {
            Self::success()
        } else {
            Self::failure()
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        self.with_data("reason", reason.into())
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPhase {
    /// First dispatch: validators run and handlers act
    #[default]
    Act,
    /// Re-dispatch after traffic has settled: terminals report their outcome
    Settle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub phase: RequestPhase,
    pub timestep: u64,
    pub agent: Option<String>,
}

impl RequestContext {
    pub fn new(timestep: u64) -> Self {
        Self {
            phase: RequestPhase::Act,
            timestep,
            agent: None,
        }
    }

    pub fn for_agent(timestep: u64, agent: &str) -> Self {
        Self {
            agent: Some(agent.to_string()),
            ..Self::new(timestep)
        }
    }

    pub fn settling(&self) -> Self {
        Self {
            phase: RequestPhase::Settle,
            ..self.clone()
        }
    }

    pub fn is_settling(&self) -> bool {
        self.phase == RequestPhase::Settle
    }
}

// ============================================================================
// VALIDATORS
// ============================================================================

pub type CheckFn<T, E> = fn(&T, &E, &[RequestToken], &RequestContext) -> bool;

pub struct ValidatorRule<T, E> {
    check: CheckFn<T, E>,
    fail_message: &'static str,
}

impl<T, E> Clone for ValidatorRule<T, E> {
    fn clone(&self) -> Self {
        Self {
            check: self.check,
            fail_message: self.fail_message,
        }
    }
}

/// A conjunction of predicates that must all hold before a handler runs.
pub struct Validator<T, E = ()> {
    rules: Vec<ValidatorRule<T, E>>,
}

impl<T, E> Clone for Validator<T, E> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
        }
    }
}

impl<T, E> Validator<T, E> {
    pub fn allow_all() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn new(check: CheckFn<T, E>, fail_message: &'static str) -> Self {
        Self {
            rules: vec![ValidatorRule {
                check,
                fail_message,
            }],
        }
    }

    pub fn and(mut self, other: Validator<T, E>) -> Self {
        self.rules.extend(other.rules);
        self
    }

    /// First failing rule's message, if any
    pub fn check(
        &self,
        target: &T,
        env: &E,
        request: &[RequestToken],
        context: &RequestContext,
    ) -> Result<(), &'static str> {
        for rule in &self.rules {
            if !(rule.check)(target, env, request, context) {
                return Err(rule.fail_message);
            }
        }
        Ok(())
    }

    pub fn fail_message(&self) -> String {
        self.rules
            .iter()
            .map(|rule| rule.fail_message)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// REQUEST TYPES AND MANAGER
// ============================================================================

pub type RequestFn<T, E> =
    fn(&mut T, &mut E, &[RequestToken], &RequestContext) -> Result<RequestResponse, RequestError>;

pub struct RequestType<T, E = ()> {
    pub func: RequestFn<T, E>,
    pub validator: Validator<T, E>,
    /// Reports the final outcome of a handler that answered `pending`
    pub settle: Option<RequestFn<T, E>>,
    /// Present on routes: validates the remainder of the path against the child
    pub descend: Option<CheckFn<T, E>>,
}

impl<T, E> Clone for RequestType<T, E> {
    fn clone(&self) -> Self {
        Self {
            func: self.func,
            validator: self.validator.clone(),
            settle: self.settle,
            descend: self.descend,
        }
    }
}

impl<T, E> RequestType<T, E> {
    pub fn new(func: RequestFn<T, E>) -> Self {
        Self {
            func,
            validator: Validator::allow_all(),
            settle: None,
            descend: None,
        }
    }

    pub fn route(func: RequestFn<T, E>, descend: CheckFn<T, E>) -> Self {
        Self {
            descend: Some(descend),
            ..Self::new(func)
        }
    }

    pub fn with_validator(mut self, validator: Validator<T, E>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_settle(mut self, settle: RequestFn<T, E>) -> Self {
        self.settle = Some(settle);
        self
    }

    pub fn is_route(&self) -> bool {
        self.descend.is_some()
    }
}

pub struct RequestManager<T, E = ()> {
    request_types: BTreeMap<String, RequestType<T, E>>,
}

impl<T, E> Clone for RequestManager<T, E> {
    fn clone(&self) -> Self {
        Self {
            request_types: self.request_types.clone(),
        }
    }
}

impl<T, E> Default for RequestManager<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for RequestManager<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("requests", &self.request_names())
            .finish()
    }
}

impl<T, E> RequestManager<T, E> {
    pub fn new() -> Self {
        Self {
            request_types: BTreeMap::new(),
        }
    }

    pub fn add_request(&mut self, name: &str, request_type: RequestType<T, E>) -> Result<(), RequestError> {
        if self.request_types.contains_key(name) {
            return Err(RequestError::DuplicateRequest(name.to_string()));
        }
        self.request_types.insert(name.to_string(), request_type);
        Ok(())
    }

    /// Builder-style registration; a later registration replaces an earlier one.
    pub fn with(mut self, name: &str, request_type: RequestType<T, E>) -> Self {
        if self.request_types.insert(name.to_string(), request_type).is_some() {
            log::warn!("request '{}' registered twice, keeping the latest", name);
        }
        self
    }

    pub fn remove_request(&mut self, name: &str) -> bool {
        self.request_types.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.request_types.contains_key(name)
    }

    pub fn request_names(&self) -> Vec<&str> {
        self.request_types.keys().map(String::as_str).collect()
    }

    /// Split off the first token and look up its handler.
    pub fn resolve<'r>(
        &self,
        request: &'r [RequestToken],
    ) -> Result<(RequestType<T, E>, &'r [RequestToken]), RequestError> {
        let (first, remaining) = request.split_first().ok_or(RequestError::Empty)?;
        let name = token_to_string(first).ok_or_else(|| RequestError::InvalidToken(first.to_string()))?;
        let request_type = self
            .request_types
            .get(&name)
            .ok_or_else(|| RequestError::UnknownRequest {
                token: name.clone(),
                available: self.request_names().join(", "),
            })?;
        Ok((request_type.clone(), remaining))
    }
}

/// Implemented by every component that sits in the request tree.
pub trait RequestHandler<E = ()>: Sized {
    fn request_manager(&self) -> &RequestManager<Self, E>;

    fn handle_request(
        &mut self,
        env: &mut E,
        request: &[RequestToken],
        context: &RequestContext,
    ) -> Result<RequestResponse, RequestError> {
        let (request_type, remaining) = self.request_manager().resolve(request)?;

        if context.is_settling() {
            if request_type.is_route() {
                return (request_type.func)(self, env, remaining, context);
            }
            return match request_type.settle {
                Some(settle) => settle(self, env, remaining, context),
                None => Ok(RequestResponse::failure().with_reason("request has no pending outcome")),
            };
        }

        if let Err(reason) = request_type.validator.check(self, env, remaining, context) {
            log::debug!("request {:?} rejected: {}", request, reason);
            return Ok(RequestResponse::failure().with_reason(reason));
        }
        (request_type.func)(self, env, remaining, context)
    }

    /// Whether the request would pass every validator along its path.
    fn check_valid(&self, env: &E, request: &[RequestToken], context: &RequestContext) -> bool {
        let Ok((request_type, remaining)) = self.request_manager().resolve(request) else {
            return false;
        };
        if request_type.validator.check(self, env, remaining, context).is_err() {
            return false;
        }
        match request_type.descend {
            Some(descend) => descend(self, env, remaining, context),
            None => true,
        }
    }
}

// ============================================================================
// ARGUMENT HELPERS
// ============================================================================

pub fn token_to_string(token: &RequestToken) -> Option<String> {
    match token {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Number of tokens excluding a trailing options object
pub fn positional_len(request: &[RequestToken]) -> usize {
    match request.last() {
        Some(Value::Object(_)) => request.len() - 1,
        _ => request.len(),
    }
}

pub fn expect_args(request: &[RequestToken], expected: usize, name: &'static str) -> Result<(), RequestError> {
    let got = positional_len(request);
    if got != expected {
        return Err(RequestError::Arity {
            request: name,
            expected,
            got,
        });
    }
    Ok(())
}

pub fn arg_str(
    request: &[RequestToken],
    index: usize,
    name: &'static str,
    argument: &'static str,
) -> Result<String, RequestError> {
    if index >= positional_len(request) {
        return Err(RequestError::MissingArgument {
            request: name,
            argument,
        });
    }
    token_to_string(&request[index]).ok_or_else(|| RequestError::InvalidToken(request[index].to_string()))
}

pub fn arg_parse<P: FromStr>(
    request: &[RequestToken],
    index: usize,
    name: &'static str,
    argument: &'static str,
) -> Result<P, RequestError> {
    let raw = arg_str(request, index, name, argument)?;
    raw.parse::<P>().map_err(|_| RequestError::InvalidArgument {
        field: argument,
        value: raw,
    })
}

/// The trailing options object, or an empty map
pub fn options(request: &[RequestToken]) -> Map<String, Value> {
    match request.last() {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone)]
    struct Counter {
        value: i64,
        locked: bool,
        pending_result: Option<bool>,
        request_manager: RequestManager<Counter, Vec<String>>,
    }

    fn increment(
        counter: &mut Counter,
        journal: &mut Vec<String>,
        request: &[RequestToken],
        _context: &RequestContext,
    ) -> Result<RequestResponse, RequestError> {
        expect_args(request, 1, "increment")?;
        let amount: i64 = arg_parse(request, 0, "increment", "amount")?;
        counter.value += amount;
        journal.push(format!("+{}", amount));
        Ok(RequestResponse::success().with_data("value", counter.value))
    }

    fn start_job(
        counter: &mut Counter,
        _journal: &mut Vec<String>,
        _request: &[RequestToken],
        _context: &RequestContext,
    ) -> Result<RequestResponse, RequestError> {
        counter.pending_result = Some(true);
        Ok(RequestResponse::pending())
    }

    fn settle_job(
        counter: &mut Counter,
        _journal: &mut Vec<String>,
        _request: &[RequestToken],
        _context: &RequestContext,
    ) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(counter.pending_result == Some(true)))
    }

    fn is_unlocked(counter: &Counter, _: &Vec<String>, _: &[RequestToken], _: &RequestContext) -> bool {
        !counter.locked
    }

    fn is_small(counter: &Counter, _: &Vec<String>, _: &[RequestToken], _: &RequestContext) -> bool {
        counter.value < 10
    }

    impl RequestHandler<Vec<String>> for Counter {
        fn request_manager(&self) -> &RequestManager<Self, Vec<String>> {
            &self.request_manager
        }
    }

    fn counter() -> Counter {
        let validator = Validator::new(is_unlocked, "Counter is locked.")
            .and(Validator::new(is_small, "Counter is too large."));
        Counter {
            value: 0,
            locked: false,
            pending_result: None,
            request_manager: RequestManager::new()
                .with("increment", RequestType::new(increment).with_validator(validator))
                .with("job", RequestType::new(start_job).with_settle(settle_job)),
        }
    }

    #[test]
    fn test_dispatch_runs_handler_with_environment() {
        let mut counter = counter();
        let mut journal = Vec::new();
        let context = RequestContext::new(0);
        let response = counter
            .handle_request(&mut journal, &crate::request!["increment", 3], &context)
            .expect("routable");
        assert!(response.is_success());
        assert_eq!(response.data["value"], json!(3));
        assert_eq!(journal, vec!["+3"]);
    }

    #[test]
    fn test_validators_compose_and_report_first_failure() {
        let mut counter = counter();
        let mut journal = Vec::new();
        let context = RequestContext::new(0);

        counter.value = 12;
        let response = counter
            .handle_request(&mut journal, &crate::request!["increment", 1], &context)
            .expect("routable");
        assert_eq!(response.status, RequestStatus::Failure);
        assert_eq!(response.reason(), Some("Counter is too large."));

        counter.locked = true;
        let response = counter
            .handle_request(&mut journal, &crate::request!["increment", 1], &context)
            .expect("routable");
        assert_eq!(response.reason(), Some("Counter is locked."));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_malformed_requests_are_errors() {
        let mut counter = counter();
        let mut journal = Vec::new();
        let context = RequestContext::new(0);

        let unknown = counter.handle_request(&mut journal, &crate::request!["decrement", 1], &context);
        assert!(matches!(unknown, Err(RequestError::UnknownRequest { .. })));

        let arity = counter.handle_request(&mut journal, &crate::request!["increment", 1, 2], &context);
        assert!(matches!(arity, Err(RequestError::Arity { expected: 1, got: 2, .. })));

        let empty = counter.handle_request(&mut journal, &[], &context);
        assert_eq!(empty, Err(RequestError::Empty));

        let garbage = counter.handle_request(&mut journal, &crate::request!["increment", "many"], &context);
        assert!(matches!(garbage, Err(RequestError::InvalidArgument { .. })));
    }

    #[test]
    fn test_trailing_options_do_not_count_as_arguments() {
        let mut counter = counter();
        let mut journal = Vec::new();
        let request = vec![json!("increment"), json!(2), json!({"note": "ignored"})];
        let response = counter
            .handle_request(&mut journal, &request, &RequestContext::new(0))
            .expect("routable");
        assert!(response.is_success());
        assert_eq!(options(&request[1..])["note"], json!("ignored"));
    }

    #[test]
    fn test_pending_request_settles_in_second_phase() {
        let mut counter = counter();
        let mut journal = Vec::new();
        let context = RequestContext::new(0);
        let first = counter
            .handle_request(&mut journal, &crate::request!["job"], &context)
            .expect("routable");
        assert!(first.is_pending());
        let settled = counter
            .handle_request(&mut journal, &crate::request!["job"], &context.settling())
            .expect("routable");
        assert!(settled.is_success());
    }

    #[test]
    fn test_check_valid_has_no_side_effects() {
        let counter = counter();
        let journal = Vec::new();
        let context = RequestContext::new(0);
        assert!(counter.check_valid(&journal, &crate::request!["increment", 1], &context));
        assert!(!counter.check_valid(&journal, &crate::request!["missing"], &context));
        assert_eq!(counter.value, 0);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut manager: RequestManager<Counter, Vec<String>> = RequestManager::new();
        manager.add_request("job", RequestType::new(start_job)).expect("first");
        assert_eq!(
            manager.add_request("job", RequestType::new(start_job)),
            Err(RequestError::DuplicateRequest("job".to_string()))
        );
    }

    #[test]
    fn test_response_from_bool() {
        assert_eq!(RequestResponse::from_bool(true).status, RequestStatus::Success);
        assert_eq!(RequestResponse::from_bool(false).status, RequestStatus::Failure);
    }
}
