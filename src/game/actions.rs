//! Action space
//!
//! Agents pick actions as an index into their action map; each entry names an
//! action identifier and its options. The manager formats an identifier plus
//! options into a request path the simulation understands.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ConfigError, RequestError};
use crate::request::{token_to_string, Request};

const SERVICE_VERBS: &[&str] = &["scan", "stop", "start", "pause", "resume", "restart", "disable", "enable", "fix"];
const APPLICATION_VERBS: &[&str] = &["execute", "scan", "close", "fix", "run"];
const FILE_VERBS: &[&str] = &["scan", "corrupt", "repair", "restore", "access"];
const FOLDER_VERBS: &[&str] = &["scan", "corrupt", "repair", "restore"];
const BEACON_SETTINGS: &[&str] = &[
    "c2_server_ip_address",
    "keep_alive_frequency",
    "masquerade_protocol",
    "masquerade_port",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionConfig {
    pub action: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionManager {
    action_map: BTreeMap<usize, ActionConfig>,
}

impl ActionManager {
    /// The action map must use every index from 0 to N-1
    pub fn new(action_map: BTreeMap<usize, ActionConfig>) -> Result<Self, ConfigError> {
        if let Some((index, _)) = action_map.iter().enumerate().find(|(expected, (index, _))| expected != *index) {
            return Err(ConfigError::Invalid(format!("action map is missing index {}", index)));
        }
        Ok(Self { action_map })
    }

    pub fn len(&self) -> usize {
        self.action_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.action_map.is_empty()
    }

    pub fn get_action(&self, index: usize) -> Result<(String, Map<String, Value>), RequestError> {
        self.action_map
            .get(&index)
            .map(|config| (config.action.clone(), config.options.clone()))
            .ok_or_else(|| RequestError::UnknownAction(index.to_string()))
    }

    pub fn actions(&self) -> impl Iterator<Item = (usize, &ActionConfig)> {
        self.action_map.iter().map(|(index, config)| (*index, config))
    }

    pub fn form_request(&self, identifier: &str, options: &Map<String, Value>) -> Result<Request, RequestError> {
        form_request(identifier, options)
    }
}

fn option(options: &Map<String, Value>, action: &str, key: &'static str) -> Result<Value, RequestError> {
    let value = options.get(key).ok_or_else(|| RequestError::MissingOption {
        action: action.to_string(),
        option: key,
    })?;
    token_to_string(value)
        .map(Value::from)
        .ok_or_else(|| RequestError::InvalidToken(value.to_string()))
}

fn option_or_any(options: &Map<String, Value>, key: &str) -> Value {
    options
        .get(key)
        .and_then(token_to_string)
        .map_or_else(|| Value::from("ALL"), Value::from)
}

/// The request tokens a c2 server sends to its beacon
fn c2_command(options: &Map<String, Value>, action: &str) -> Result<Vec<Value>, RequestError> {
    match options.get("command") {
        Some(Value::Array(tokens)) if !tokens.is_empty() => Ok(tokens.clone()),
        Some(other) => Err(RequestError::InvalidToken(other.to_string())),
        None => Err(RequestError::MissingOption {
            action: action.to_string(),
            option: "command",
        }),
    }
}

/// The nine ACL add_rule arguments, position last
fn acl_rule_args(options: &Map<String, Value>, action: &str) -> Result<Vec<Value>, RequestError> {
    let mut args = vec![option(options, action, "permission")?];
    for key in [
        "protocol_name",
        "src_ip",
        "src_wildcard",
        "src_port",
        "dst_ip",
        "dst_wildcard",
        "dst_port",
    ] {
        args.push(option_or_any(options, key));
    }
    args.push(option(options, action, "position")?);
    Ok(args)
}

/// Turn an action identifier and its options into a request path
pub fn form_request(identifier: &str, options: &Map<String, Value>) -> Result<Request, RequestError> {
    let node = |key: &'static str| -> Result<Request, RequestError> {
        Ok(vec![Value::from("network"), Value::from("node"), option(options, identifier, key)?])
    };
    let with = |mut request: Request, tail: Vec<Value>| {
        request.extend(tail);
        request
    };

    let request = match identifier {
        "do-nothing" => crate::request!["do_nothing"],
        "node-os-scan" => with(node("node_name")?, crate::request!["os", "scan"]),
        "node-startup" => with(node("node_name")?, crate::request!["startup"]),
        "node-shutdown" => with(node("node_name")?, crate::request!["shutdown"]),
        "node-reset" => with(node("node_name")?, crate::request!["reset"]),
        "node-nic-enable" | "node-nic-disable" => {
            let verb = if identifier.ends_with("enable") { "enable" } else { "disable" };
            with(
                node("node_name")?,
                vec![
                    Value::from("network_interface"),
                    option(options, identifier, "nic_num")?,
                    Value::from(verb),
                ],
            )
        }
        "node-file-create" => with(
            node("node_name")?,
            vec![
                Value::from("file_system"),
                Value::from("create_file"),
                option(options, identifier, "folder_name")?,
                option(options, identifier, "file_name")?,
            ],
        ),
        "node-file-delete" => with(
            node("node_name")?,
            vec![
                Value::from("file_system"),
                Value::from("delete_file"),
                option(options, identifier, "folder_name")?,
                option(options, identifier, "file_name")?,
            ],
        ),
        "node-folder-create" => with(
            node("node_name")?,
            vec![
                Value::from("file_system"),
                Value::from("create_folder"),
                option(options, identifier, "folder_name")?,
            ],
        ),
        "node-application-install" | "node-application-remove" => {
            let verb = if identifier.ends_with("install") { "install" } else { "uninstall" };
            with(
                node("node_name")?,
                vec![
                    Value::from("software_manager"),
                    Value::from(verb),
                    option(options, identifier, "application_name")?,
                ],
            )
        }
        "node-c2-beacon-configure" => {
            let settings: Map<String, Value> = options
                .iter()
                .filter(|(key, _)| BEACON_SETTINGS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            with(
                node("node_name")?,
                vec![
                    Value::from("application"),
                    Value::from("c2-beacon"),
                    Value::from("configure"),
                    Value::Object(settings),
                ],
            )
        }
        "node-c2-server-command" | "node-c2-server-bot-launch" => {
            let command = if identifier == "node-c2-server-command" {
                c2_command(options, identifier)?
            } else {
                crate::request!["application", "data-manipulation-bot", "execute"]
            };
            let mut request = with(
                node("node_name")?,
                crate::request!["application", "c2-server", "command"],
            );
            request.extend(command);
            request
        }
        "router-acl-add-rule" => {
            let mut request = vec![
                Value::from("network"),
                Value::from("node"),
                option(options, identifier, "target_router")?,
                Value::from("acl"),
                Value::from("add_rule"),
            ];
            request.extend(acl_rule_args(options, identifier)?);
            request
        }
        "router-acl-remove-rule" => vec![
            Value::from("network"),
            Value::from("node"),
            option(options, identifier, "target_router")?,
            Value::from("acl"),
            Value::from("remove_rule"),
            option(options, identifier, "position")?,
        ],
        "firewall-acl-add-rule" | "firewall-acl-remove-rule" => {
            let mut request = vec![
                Value::from("network"),
                Value::from("node"),
                option(options, identifier, "target_firewall_nodename")?,
                option(options, identifier, "firewall_port_name")?,
                option(options, identifier, "firewall_port_direction")?,
                Value::from("acl"),
            ];
            if identifier == "firewall-acl-add-rule" {
                request.push(Value::from("add_rule"));
                request.extend(acl_rule_args(options, identifier)?);
            } else {
                request.push(Value::from("remove_rule"));
                request.push(option(options, identifier, "position")?);
            }
            request
        }
        _ => return form_software_request(identifier, options),
    };
    Ok(request)
}

/// node-service-*, node-application-*, node-file-* and node-folder-* verbs
fn form_software_request(identifier: &str, options: &Map<String, Value>) -> Result<Request, RequestError> {
    let unknown = || RequestError::UnknownAction(identifier.to_string());
    let mut request = vec![
        Value::from("network"),
        Value::from("node"),
        option(options, identifier, "node_name")?,
    ];

    if let Some(verb) = identifier.strip_prefix("node-service-") {
        if !SERVICE_VERBS.contains(&verb) {
            return Err(unknown());
        }
        request.extend([Value::from("service"), option(options, identifier, "service_name")?, Value::from(verb)]);
    } else if let Some(verb) = identifier.strip_prefix("node-application-") {
        if !APPLICATION_VERBS.contains(&verb) {
            return Err(unknown());
        }
        request.extend([
            Value::from("application"),
            option(options, identifier, "application_name")?,
            Value::from(verb),
        ]);
    } else if let Some(verb) = identifier.strip_prefix("node-file-") {
        if !FILE_VERBS.contains(&verb) {
            return Err(unknown());
        }
        request.extend([
            Value::from("file_system"),
            Value::from("folder"),
            option(options, identifier, "folder_name")?,
            Value::from("file"),
            option(options, identifier, "file_name")?,
            Value::from(verb),
        ]);
    } else if let Some(verb) = identifier.strip_prefix("node-folder-") {
        if !FOLDER_VERBS.contains(&verb) {
            return Err(unknown());
        }
        request.extend([
            Value::from("file_system"),
            Value::from("folder"),
            option(options, identifier, "folder_name")?,
            Value::from(verb),
        ]);
    } else {
        return Err(unknown());
    }
    Ok(request)
}
