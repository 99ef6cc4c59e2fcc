//! Agents
//!
//! An agent turns an observation into an action identifier plus options,
//! which its action manager formats into a request. Proxy agents relay a
//! choice made outside the simulation, controlled agents are driven directly
//! by test and demo code, and probabilistic agents sample from a seeded
//! distribution over their action map.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::actions::{ActionConfig, ActionManager};
use super::rewards::{RewardComponentConfig, RewardFunction};
use crate::error::{ConfigError, RequestError};
use crate::request::{Request, RequestResponse};

const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// One step of an agent's action history
#[derive(Debug, Clone, PartialEq)]
pub struct AgentHistoryItem {
    pub timestep: u64,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub request: Request,
    pub response: RequestResponse,
}

// ============================================================================
// POLICIES
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProbabilisticPolicy {
    rng: ChaCha8Rng,
    weights: WeightedIndex<f64>,
    probabilities: Vec<f64>,
}

impl ProbabilisticPolicy {
    /// `probabilities` must cover every action index 0..N and sum to one.
    /// An empty map means uniform over the action map.
    pub fn new(
        probabilities: &BTreeMap<usize, f64>,
        num_actions: usize,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if num_actions == 0 {
            return Err(ConfigError::InvalidProbabilities("action map is empty".to_string()));
        }
        let probabilities: Vec<f64> = if probabilities.is_empty() {
            vec![1.0 / num_actions as f64; num_actions]
        } else {
            if probabilities.len() != num_actions || !(0..num_actions).all(|index| probabilities.contains_key(&index)) {
                return Err(ConfigError::InvalidProbabilities(format!(
                    "keys must be exactly 0..{} to match the action map",
                    num_actions
                )));
            }
            probabilities.values().copied().collect()
        };
        let sum: f64 = probabilities.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(ConfigError::InvalidProbabilities(format!("probabilities sum to {}", sum)));
        }
        let weights = WeightedIndex::new(&probabilities)
            .map_err(|error| ConfigError::InvalidProbabilities(error.to_string()))?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            weights,
            probabilities,
        })
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn sample(&mut self) -> usize {
        self.weights.sample(&mut self.rng)
    }
}

#[derive(Debug, Clone)]
pub enum AgentKind {
    /// Acts on an action index stored from outside before each step
    Proxy { next_action: Option<usize> },
    /// Acts on a fully formed (identifier, options) pair stored before each step
    Controlled { next_action: Option<(String, Map<String, Value>)> },
    Probabilistic(ProbabilisticPolicy),
    DoNothing,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    ProxyAgent,
    ControlledAgent,
    ProbabilisticAgent,
    DoNothingAgent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub action_map: BTreeMap<usize, ActionConfig>,
    /// Probabilistic agents only; empty means uniform
    #[serde(default)]
    pub action_probabilities: BTreeMap<usize, f64>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub reward_components: Vec<RewardComponentConfig>,
}

// ============================================================================
// AGENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct Agent {
    name: String,
    kind: AgentKind,
    pub action_manager: ActionManager,
    pub reward_function: RewardFunction,
    history: Vec<AgentHistoryItem>,
    observation: Value,
}

impl Agent {
    pub fn new(name: &str, kind: AgentKind, action_manager: ActionManager, reward_function: RewardFunction) -> Self {
        Self {
            name: name.to_string(),
            kind,
            action_manager,
            reward_function,
            history: Vec::new(),
            observation: Value::Null,
        }
    }

    /// `seed` applies to probabilistic agents without their own seed
    pub fn from_config(config: &AgentConfig, seed: u64) -> Result<Self, ConfigError> {
        let action_manager = ActionManager::new(config.action_map.clone())?;
        let kind = match config.agent_type {
            AgentType::ProxyAgent => AgentKind::Proxy { next_action: None },
            AgentType::ControlledAgent => AgentKind::Controlled { next_action: None },
            AgentType::DoNothingAgent => AgentKind::DoNothing,
            AgentType::ProbabilisticAgent => AgentKind::Probabilistic(ProbabilisticPolicy::new(
                &config.action_probabilities,
                action_manager.len(),
                config.seed.unwrap_or(seed),
            )?),
        };
        Ok(Self::new(
            &config.name,
            kind,
            action_manager,
            RewardFunction::from_config(&config.reward_components),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &AgentKind {
        &self.kind
    }

    pub fn history(&self) -> &[AgentHistoryItem] {
        &self.history
    }

    pub fn last_action(&self) -> Option<&AgentHistoryItem> {
        self.history.last()
    }

    pub fn observation(&self) -> &Value {
        &self.observation
    }

    pub fn update_observation(&mut self, state: &Value) {
        self.observation = state.clone();
    }

    /// Queue the action index a proxy agent plays on the next step
    pub fn store_action_index(&mut self, action: usize) -> bool {
        match &mut self.kind {
            AgentKind::Proxy { next_action } => {
                *next_action = Some(action);
                true
            }
            _ => false,
        }
    }

    /// Queue the action a controlled agent plays on the next step
    pub fn store_action(&mut self, identifier: &str, options: Map<String, Value>) -> bool {
        match &mut self.kind {
            AgentKind::Controlled { next_action } => {
                *next_action = Some((identifier.to_string(), options));
                true
            }
            _ => false,
        }
    }

    /// Choose this step's action; anything without a queued choice does nothing
    pub fn get_action(&mut self, _timestep: u64) -> Result<(String, Map<String, Value>), RequestError> {
        let do_nothing = || ("do-nothing".to_string(), Map::new());
        match &mut self.kind {
            AgentKind::Proxy { next_action } => match next_action.take() {
                Some(index) => self.action_manager.get_action(index),
                None => Ok(do_nothing()),
            },
            AgentKind::Controlled { next_action } => Ok(next_action.take().unwrap_or_else(do_nothing)),
            AgentKind::Probabilistic(policy) => {
                let index = policy.sample();
                self.action_manager.get_action(index)
            }
            AgentKind::DoNothing => Ok(do_nothing()),
        }
    }

    pub fn format_request(&self, identifier: &str, options: &Map<String, Value>) -> Result<Request, RequestError> {
        self.action_manager.form_request(identifier, options)
    }

    /// Score the last action against `state`; shared rewards read `agent_rewards`
    pub fn update_reward(&mut self, state: &Value, agent_rewards: &BTreeMap<String, f64>) -> f64 {
        let reward = self.reward_function.update(state, self.history.last(), agent_rewards);
        self.reward_function.total_reward += reward;
        reward
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.observation = Value::Null;
        self.reward_function.reset();
        if let AgentKind::Proxy { next_action } = &mut self.kind {
            *next_action = None;
        }
        if let AgentKind::Controlled { next_action } = &mut self.kind {
            *next_action = None;
        }
    }

    pub fn process_action_response(
        &mut self,
        timestep: u64,
        action: String,
        parameters: Map<String, Value>,
        request: Request,
        response: RequestResponse,
    ) {
        self.history.push(AgentHistoryItem {
            timestep,
            action,
            parameters,
            request,
            response,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action_map(n: usize) -> BTreeMap<usize, ActionConfig> {
        (0..n)
            .map(|index| {
                let config = ActionConfig {
                    action: "node-os-scan".to_string(),
                    options: json!({"node_name": format!("client_{}", index)})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                };
                (index, config)
            })
            .collect()
    }

    #[test]
    fn test_probabilities_must_sum_to_one() {
        let probabilities: BTreeMap<usize, f64> = [(0, 0.5), (1, 0.4)].into_iter().collect();
        assert!(matches!(
            ProbabilisticPolicy::new(&probabilities, 2, 0),
            Err(ConfigError::InvalidProbabilities(_))
        ));
    }

    #[test]
    fn test_probabilities_must_cover_every_action() {
        let probabilities: BTreeMap<usize, f64> = [(0, 0.5), (2, 0.5)].into_iter().collect();
        assert!(ProbabilisticPolicy::new(&probabilities, 2, 0).is_err());
    }

    #[test]
    fn test_default_distribution_is_uniform() {
        let policy = ProbabilisticPolicy::new(&BTreeMap::new(), 4, 0).expect("uniform");
        assert!(policy.probabilities().iter().all(|p| (*p - 0.25).abs() < 1e-12));
    }

    #[test]
    fn test_same_seed_same_choices() {
        let probabilities: BTreeMap<usize, f64> = [(0, 0.2), (1, 0.3), (2, 0.5)].into_iter().collect();
        let mut a = ProbabilisticPolicy::new(&probabilities, 3, 42).expect("valid");
        let mut b = ProbabilisticPolicy::new(&probabilities, 3, 42).expect("valid");
        let first: Vec<usize> = (0..50).map(|_| a.sample()).collect();
        let second: Vec<usize> = (0..50).map(|_| b.sample()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_probability_actions_never_chosen() {
        let probabilities: BTreeMap<usize, f64> = [(0, 0.0), (1, 1.0)].into_iter().collect();
        let mut policy = ProbabilisticPolicy::new(&probabilities, 2, 7).expect("valid");
        assert!((0..100).all(|_| policy.sample() == 1));
    }

    #[test]
    fn test_proxy_agent_plays_stored_index_once() {
        let manager = ActionManager::new(action_map(2)).expect("valid action map");
        let mut agent = Agent::new("defender", AgentKind::Proxy { next_action: None }, manager, RewardFunction::default());
        assert!(agent.store_action_index(1));
        let (action, options) = agent.get_action(0).expect("mapped");
        assert_eq!(action, "node-os-scan");
        assert_eq!(options["node_name"], "client_1");
        assert_eq!(agent.get_action(1).expect("default").0, "do-nothing");
    }

    #[test]
    fn test_agent_config_parses() {
        let config: AgentConfig = serde_json::from_value(json!({
            "ref": "attacker",
            "type": "probabilistic-agent",
            "action_probabilities": {"0": 0.5, "1": 0.5},
            "action_map": {
                "0": {"action": "do-nothing", "options": {}},
                "1": {"action": "node-os-scan", "options": {"node_name": "client_1"}}
            }
        }))
        .expect("valid agent config");
        let agent = Agent::from_config(&config, 3).expect("valid agent");
        assert_eq!(agent.name(), "attacker");
        assert!(matches!(agent.kind(), AgentKind::Probabilistic(_)));
    }
}
