//! Reward functions
//!
//! Every agent owns a weighted sum of reward components. Components read the
//! simulation state snapshot and the agent's most recent action; a shared
//! reward reads another agent's current reward, so agents are scored in an
//! order where every dependency has already been updated.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use super::agent::AgentHistoryItem;
use crate::error::ConfigError;
use crate::services::database_service::{DATABASE_FILE, DATABASE_FOLDER};

const HTTP_OK: u64 = 200;
const HTTP_NOT_FOUND: u64 = 404;

fn default_weight() -> f64 {
    1.0
}

fn default_sticky() -> bool {
    true
}

fn default_database_folder() -> String {
    DATABASE_FOLDER.to_string()
}

fn default_database_file() -> String {
    DATABASE_FILE.to_string()
}

fn default_web_service() -> String {
    "web-server".to_string()
}

// ============================================================================
// COMPONENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RewardComponentKind {
    /// +1 while the file is GOOD, -1 while it is CORRUPT
    DatabaseFileIntegrity {
        node_hostname: String,
        #[serde(default = "default_database_folder")]
        folder_name: String,
        #[serde(default = "default_database_file")]
        file_name: String,
    },
    /// +1 for a 200 answer from the web server, -1 for a 404
    #[serde(rename = "web-server-404-penalty")]
    WebServer404Penalty {
        node_hostname: String,
        #[serde(default = "default_web_service")]
        service_name: String,
        #[serde(default = "default_sticky")]
        sticky: bool,
    },
    WebpageUnavailablePenalty {
        node_hostname: String,
        #[serde(default = "default_sticky")]
        sticky: bool,
    },
    GreenAdminDatabaseUnreachablePenalty {
        node_hostname: String,
        #[serde(default = "default_sticky")]
        sticky: bool,
    },
    /// The current reward of another agent
    SharedReward { agent_name: String },
    ActionPenalty {
        action_penalty: f64,
        do_nothing_penalty: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RewardComponentConfig {
    #[serde(flatten)]
    pub kind: RewardComponentKind,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn node_state<'a>(state: &'a Value, hostname: &str) -> Option<&'a Value> {
    state.get("network")?.get("nodes")?.get(hostname)
}

/// Whether the last action executed `application` on `hostname`
fn executed(last_action: Option<&AgentHistoryItem>, hostname: &str, application: &str) -> bool {
    let Some(item) = last_action else {
        return false;
    };
    let expected = crate::request!["network", "node", hostname, "application", application, "execute"];
    item.request == expected
}

#[derive(Debug, Clone)]
pub struct RewardComponent {
    pub kind: RewardComponentKind,
    last_value: f64,
}

impl RewardComponent {
    pub fn new(kind: RewardComponentKind) -> Self {
        Self { kind, last_value: 0.0 }
    }

    /// The agent this component needs scored first, if any
    pub fn dependency(&self) -> Option<&str> {
        match &self.kind {
            RewardComponentKind::SharedReward { agent_name } => Some(agent_name),
            _ => None,
        }
    }

    pub fn calculate(
        &mut self,
        state: &Value,
        last_action: Option<&AgentHistoryItem>,
        agent_rewards: &BTreeMap<String, f64>,
    ) -> f64 {
        let value = match &self.kind {
            RewardComponentKind::DatabaseFileIntegrity {
                node_hostname,
                folder_name,
                file_name,
            } => {
                let health = node_state(state, node_hostname)
                    .and_then(|node| node.get("file_system")?.get("folders")?.get(folder_name))
                    .and_then(|folder| folder.get("files")?.get(file_name)?.get("health_status")?.as_u64());
                match health {
                    Some(1) => 1.0,
                    Some(3) => -1.0,
                    _ => 0.0,
                }
            }
            RewardComponentKind::WebServer404Penalty {
                node_hostname,
                service_name,
                sticky,
            } => {
                let code = node_state(state, node_hostname)
                    .and_then(|node| node.get("services")?.get(service_name)?.get("last_response_status_code")?.as_u64());
                match code {
                    Some(HTTP_OK) => 1.0,
                    Some(HTTP_NOT_FOUND) => -1.0,
                    _ if *sticky => self.last_value,
                    _ => 0.0,
                }
            }
            RewardComponentKind::WebpageUnavailablePenalty { node_hostname, sticky } => {
                if executed(last_action, node_hostname, "web-browser") {
                    let outcome = node_state(state, node_hostname)
                        .and_then(|node| node.get("applications")?.get("web-browser")?.get("history")?.as_array()?.last())
                        .and_then(|item| item.get("outcome").cloned());
                    match outcome {
                        None => 0.0,
                        Some(Value::Number(code)) if code.as_u64() == Some(HTTP_OK) => 1.0,
                        Some(_) => -1.0,
                    }
                } else if *sticky {
                    self.last_value
                } else {
                    0.0
                }
            }
            RewardComponentKind::GreenAdminDatabaseUnreachablePenalty { node_hostname, sticky } => {
                match last_action.filter(|_| executed(last_action, node_hostname, "database-client")) {
                    Some(item) if item.response.is_success() => 1.0,
                    Some(_) => -1.0,
                    None if *sticky => self.last_value,
                    None => 0.0,
                }
            }
            RewardComponentKind::SharedReward { agent_name } => agent_rewards.get(agent_name).copied().unwrap_or(0.0),
            RewardComponentKind::ActionPenalty {
                action_penalty,
                do_nothing_penalty,
            } => match last_action {
                Some(item) if item.action == "do-nothing" => *do_nothing_penalty,
                Some(_) => *action_penalty,
                None => 0.0,
            },
        };
        self.last_value = value;
        value
    }
}

// ============================================================================
// REWARD FUNCTION
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RewardFunction {
    components: Vec<(RewardComponent, f64)>,
    pub current_reward: f64,
    pub total_reward: f64,
}

impl RewardFunction {
    pub fn from_config(configs: &[RewardComponentConfig]) -> Self {
        let mut function = Self::default();
        for config in configs {
            function.register_component(RewardComponent::new(config.kind.clone()), config.weight);
        }
        function
    }

    pub fn register_component(&mut self, component: RewardComponent, weight: f64) {
        self.components.push((component, weight));
    }

    pub fn components(&self) -> impl Iterator<Item = (&RewardComponent, f64)> {
        self.components.iter().map(|(component, weight)| (component, *weight))
    }

    pub fn reset(&mut self) {
        self.current_reward = 0.0;
        self.total_reward = 0.0;
        for (component, _) in &mut self.components {
            component.last_value = 0.0;
        }
    }

    /// Agents whose reward this function reads
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .filter_map(|(component, _)| component.dependency().map(str::to_string))
            .collect()
    }

    /// Weighted sum of all components; also stored as the current reward
    pub fn update(
        &mut self,
        state: &Value,
        last_action: Option<&AgentHistoryItem>,
        agent_rewards: &BTreeMap<String, f64>,
    ) -> f64 {
        self.current_reward = self
            .components
            .iter_mut()
            .map(|(component, weight)| component.calculate(state, last_action, agent_rewards) * *weight)
            .sum();
        self.current_reward
    }
}

/// Order agents so every shared reward is computed after the agent it reads.
///
/// `dependencies` maps each agent to the agents its reward depends on. Ties
/// keep the input order.
pub fn reward_calculation_order(
    agents: &[String],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, ConfigError> {
    for (agent, deps) in dependencies {
        if let Some(missing) = deps.iter().find(|dep| !agents.contains(dep)) {
            return Err(ConfigError::UnknownAgent(format!("{} (shared with {})", missing, agent)));
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        agent: &str,
        dependencies: &BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<String, Mark>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        match marks.get(agent).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                path.push(agent.to_string());
                return Err(ConfigError::RewardSharingCycle(path.join(" -> ")));
            }
            Mark::Unvisited => {}
        }
        marks.insert(agent.to_string(), Mark::Visiting);
        path.push(agent.to_string());
        if let Some(deps) = dependencies.get(agent) {
            for dep in deps {
                visit(dep, dependencies, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(agent.to_string(), Mark::Done);
        order.push(agent.to_string());
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut order = Vec::with_capacity(agents.len());
    for agent in agents {
        visit(agent, dependencies, &mut marks, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestResponse;
    use serde_json::json;

    fn history_item(action: &str, request: crate::request::Request, response: RequestResponse) -> AgentHistoryItem {
        AgentHistoryItem {
            timestep: 0,
            action: action.to_string(),
            parameters: serde_json::Map::new(),
            request,
            response,
        }
    }

    fn do_nothing() -> AgentHistoryItem {
        history_item("do-nothing", crate::request!["do_nothing"], RequestResponse::success())
    }

    fn browser_state(history: Value) -> Value {
        json!({"network": {"nodes": {"computer": {"applications": {"web-browser": {"history": history}}}}}})
    }

    fn execute_browser(success: bool) -> AgentHistoryItem {
        history_item(
            "node-application-execute",
            crate::request!["network", "node", "computer", "application", "web-browser", "execute"],
            RequestResponse::from_bool(success),
        )
    }

    #[test]
    fn test_webpage_penalty_non_sticky_falls_back_to_zero() {
        let mut component = RewardComponent::new(RewardComponentKind::WebpageUnavailablePenalty {
            node_hostname: "computer".to_string(),
            sticky: false,
        });
        let rewards = BTreeMap::new();
        assert_eq!(component.calculate(&browser_state(json!([])), Some(&do_nothing()), &rewards), 0.0);

        let state = browser_state(json!([{"outcome": 200}]));
        assert_eq!(component.calculate(&state, Some(&execute_browser(true)), &rewards), 1.0);
        assert_eq!(component.calculate(&state, Some(&do_nothing()), &rewards), 0.0);

        let state = browser_state(json!([{"outcome": 200}, {"outcome": 404}]));
        assert_eq!(component.calculate(&state, Some(&execute_browser(false)), &rewards), -1.0);
    }

    #[test]
    fn test_webpage_penalty_sticky_keeps_last_value() {
        let mut component = RewardComponent::new(RewardComponentKind::WebpageUnavailablePenalty {
            node_hostname: "computer".to_string(),
            sticky: true,
        });
        let rewards = BTreeMap::new();
        let state = browser_state(json!([{"outcome": 200}]));
        assert_eq!(component.calculate(&state, Some(&execute_browser(true)), &rewards), 1.0);
        assert_eq!(component.calculate(&state, Some(&do_nothing()), &rewards), 1.0);
    }

    #[test]
    fn test_web_server_404_penalty() {
        let mut component = RewardComponent::new(RewardComponentKind::WebServer404Penalty {
            node_hostname: "web_server".to_string(),
            service_name: "web-server".to_string(),
            sticky: false,
        });
        let rewards = BTreeMap::new();
        let state = |code: Value| {
            json!({"network": {"nodes": {"web_server": {"services": {"web-server": {"last_response_status_code": code}}}}}})
        };
        assert_eq!(component.calculate(&state(json!(200)), None, &rewards), 1.0);
        assert_eq!(component.calculate(&state(json!(404)), None, &rewards), -1.0);
        assert_eq!(component.calculate(&state(Value::Null), None, &rewards), 0.0);
    }

    #[test]
    fn test_green_admin_penalty_follows_response() {
        let mut component = RewardComponent::new(RewardComponentKind::GreenAdminDatabaseUnreachablePenalty {
            node_hostname: "client_1".to_string(),
            sticky: true,
        });
        let rewards = BTreeMap::new();
        let request = crate::request!["network", "node", "client_1", "application", "database-client", "execute"];
        let failed = history_item("node-application-execute", request, RequestResponse::failure());
        assert_eq!(component.calculate(&json!({}), Some(&failed), &rewards), -1.0);
        assert_eq!(component.calculate(&json!({}), Some(&do_nothing()), &rewards), -1.0);
    }

    #[test]
    fn test_action_penalty() {
        let mut component = RewardComponent::new(RewardComponentKind::ActionPenalty {
            action_penalty: -0.75,
            do_nothing_penalty: 0.125,
        });
        let rewards = BTreeMap::new();
        assert_eq!(component.calculate(&json!({}), Some(&execute_browser(true)), &rewards), -0.75);
        assert_eq!(component.calculate(&json!({}), Some(&do_nothing()), &rewards), 0.125);
    }

    #[test]
    fn test_database_file_integrity() {
        let mut component = RewardComponent::new(RewardComponentKind::DatabaseFileIntegrity {
            node_hostname: "database_server".to_string(),
            folder_name: DATABASE_FOLDER.to_string(),
            file_name: DATABASE_FILE.to_string(),
        });
        let rewards = BTreeMap::new();
        let state = |health: u64| {
            json!({"network": {"nodes": {"database_server": {"file_system": {"folders": {
                "database": {"files": {"database.db": {"health_status": health}}}
            }}}}}})
        };
        assert_eq!(component.calculate(&state(1), None, &rewards), 1.0);
        assert_eq!(component.calculate(&state(3), None, &rewards), -1.0);
        assert_eq!(component.calculate(&state(2), None, &rewards), 0.0);
    }

    #[test]
    fn test_weighted_sum_and_config() {
        let configs: Vec<RewardComponentConfig> = serde_json::from_value(json!([
            {"type": "action-penalty", "action_penalty": -1.0, "do_nothing_penalty": 0.0, "weight": 0.5},
            {"type": "shared-reward", "agent_name": "green"}
        ]))
        .expect("valid reward config");
        let mut function = RewardFunction::from_config(&configs);
        let mut rewards = BTreeMap::new();
        rewards.insert("green".to_string(), 2.0);
        assert_eq!(function.update(&json!({}), Some(&execute_browser(true)), &rewards), 1.5);
        assert_eq!(function.dependencies().into_iter().collect::<Vec<_>>(), vec!["green".to_string()]);
    }

    #[test]
    fn test_calculation_order_puts_dependencies_first() {
        let agents = vec!["defender".to_string(), "green_1".to_string(), "green_2".to_string()];
        let mut dependencies = BTreeMap::new();
        dependencies.insert(
            "defender".to_string(),
            ["green_1".to_string(), "green_2".to_string()].into_iter().collect(),
        );
        let order = reward_calculation_order(&agents, &dependencies).expect("acyclic");
        let position = |name: &str| order.iter().position(|agent| agent == name).expect("present");
        assert!(position("defender") > position("green_1"));
        assert!(position("defender") > position("green_2"));
    }

    #[test]
    fn test_calculation_order_rejects_cycles() {
        let agents = vec!["a".to_string(), "b".to_string()];
        let mut dependencies = BTreeMap::new();
        dependencies.insert("a".to_string(), ["b".to_string()].into_iter().collect());
        dependencies.insert("b".to_string(), ["a".to_string()].into_iter().collect());
        assert!(matches!(
            reward_calculation_order(&agents, &dependencies),
            Err(ConfigError::RewardSharingCycle(_))
        ));
    }
}
