//! Error types for the simulator
//!
//! Expected simulation outcomes (unknown targets, disallowed actions, blocked
//! traffic) are never errors: they surface as request responses or boolean
//! returns. The types here cover the two genuinely fatal categories: malformed
//! requests and invalid configuration.

use thiserror::Error;

use crate::frame::IpProtocol;

/// A request that could not be routed or parsed at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request is empty")]
    Empty,

    #[error("request token {0} is not a string or number")]
    InvalidToken(String),

    #[error("unknown request '{token}' (available: {available})")]
    UnknownRequest { token: String, available: String },

    #[error("request '{request}' is missing argument '{argument}'")]
    MissingArgument {
        request: &'static str,
        argument: &'static str,
    },

    #[error("request '{request}' expects {expected} argument(s) but got {got}")]
    Arity {
        request: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid value '{value}' for {field}")]
    InvalidArgument { field: &'static str, value: String },

    #[error("request name '{0}' is already registered")]
    DuplicateRequest(String),

    #[error("action '{action}' is missing option '{option}'")]
    MissingOption { action: String, option: &'static str },

    #[error("unknown action '{0}'")]
    UnknownAction(String),
}

/// Problems detected while building a network, simulation or game.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),

    #[error("unknown application type '{0}'")]
    UnknownApplicationType(String),

    #[error("duplicate hostname '{0}'")]
    DuplicateHostname(String),

    #[error("no node with hostname '{0}'")]
    UnknownNode(String),

    #[error("node '{hostname}' has no port {port}")]
    UnknownPort { hostname: String, port: usize },

    #[error("port {port} on '{hostname}' is already linked")]
    PortInUse { hostname: String, port: usize },

    #[error("node '{hostname}': {reason}")]
    InvalidNode { hostname: String, reason: String },

    #[error("duplicate agent name '{0}'")]
    DuplicateAgent(String),

    #[error("no agent named '{0}'")]
    UnknownAgent(String),

    #[error("cycle detected in agent reward sharing: {0}")]
    RewardSharingCycle(String),

    #[error("invalid action probabilities: {0}")]
    InvalidProbabilities(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A frame whose layers are inconsistent with each other.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("IP protocol {protocol} requires a {header} header")]
    MissingHeader {
        protocol: IpProtocol,
        header: &'static str,
    },

    #[error("frame cannot carry both TCP and UDP headers")]
    ConflictingTransport,
}

/// Umbrella error for the crate.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;
