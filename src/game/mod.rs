//! Game layer
//!
//! A game steps the simulation on behalf of a fixed set of agents. Each step
//! clears per-step state, applies every agent's action in registration order
//! (each request fully settled before the next), advances the timestep and
//! then hands every agent its observation and reward. Agents are scored in an
//! order where shared rewards always see up-to-date values.

pub mod actions;
pub mod agent;
pub mod rewards;
pub mod scenarios;

pub use actions::*;
pub use agent::*;
pub use rewards::*;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::config::GameSettings;
use crate::error::{ConfigError, RequestError};
use crate::request::RequestContext;
use crate::simulation::Simulation;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GameConfig {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl GameConfig {
    pub fn from_json_str(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone)]
pub struct Game {
    pub simulation: Simulation,
    initial_simulation: Simulation,
    agents: Vec<Agent>,
    reward_order: Vec<usize>,
    step_counter: u64,
    settings: GameSettings,
}

impl Game {
    /// Agents keep the given order for acting; reward order is derived from
    /// shared-reward dependencies and rejects cycles
    pub fn new(simulation: Simulation, agents: Vec<Agent>) -> Result<Self, ConfigError> {
        let mut names = BTreeSet::new();
        for agent in &agents {
            if !names.insert(agent.name().to_string()) {
                return Err(ConfigError::DuplicateAgent(agent.name().to_string()));
            }
        }

        let ordered_names: Vec<String> = agents.iter().map(|agent| agent.name().to_string()).collect();
        let dependencies: BTreeMap<String, BTreeSet<String>> = agents
            .iter()
            .map(|agent| (agent.name().to_string(), agent.reward_function.dependencies()))
            .collect();
        let reward_order = rewards::reward_calculation_order(&ordered_names, &dependencies)?
            .iter()
            .filter_map(|name| ordered_names.iter().position(|candidate| candidate == name))
            .collect();

        let settings = simulation.config().game;
        Ok(Self {
            initial_simulation: simulation.snapshot(),
            simulation,
            agents,
            reward_order,
            step_counter: 0,
            settings,
        })
    }

    /// Probabilistic agents without their own seed get the game seed offset by
    /// their registration index
    pub fn from_config(simulation: Simulation, config: &GameConfig) -> Result<Self, ConfigError> {
        let seed = simulation.config().game.seed;
        let agents = config
            .agents
            .iter()
            .enumerate()
            .map(|(index, agent)| Agent::from_config(agent, seed.wrapping_add(index as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(simulation, agents)
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.name() == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|agent| agent.name() == name)
    }

    /// Names in the order rewards are calculated
    pub fn reward_calculation_order(&self) -> Vec<&str> {
        self.reward_order.iter().map(|index| self.agents[*index].name()).collect()
    }

    pub fn get_sim_state(&self) -> Value {
        self.simulation.describe_state()
    }

    pub fn step(&mut self) -> Result<(), RequestError> {
        debug!("game step {}", self.step_counter);
        self.simulation.pre_timestep(self.step_counter);

        if self.step_counter == 0 {
            let state = self.get_sim_state();
            for agent in &mut self.agents {
                agent.update_observation(&state);
            }
        }

        self.apply_agent_actions()?;
        self.advance_timestep();
        let state = self.get_sim_state();
        self.update_agents(&state);
        Ok(())
    }

    fn apply_agent_actions(&mut self) -> Result<(), RequestError> {
        let timestep = self.step_counter;
        for agent in &mut self.agents {
            let (action, parameters) = agent.get_action(timestep)?;
            let request = agent.format_request(&action, &parameters)?;
            let context = RequestContext::for_agent(timestep, agent.name());
            let response = self.simulation.apply_request(&request, &context)?;
            debug!("{} -> {} ({})", agent.name(), action, response.status);
            agent.process_action_response(timestep, action, parameters, request, response);
        }
        Ok(())
    }

    fn advance_timestep(&mut self) {
        self.step_counter += 1;
        self.simulation.apply_timestep(self.step_counter);
    }

    fn update_agents(&mut self, state: &Value) {
        let mut agent_rewards = BTreeMap::new();
        for &index in &self.reward_order {
            let agent = &mut self.agents[index];
            agent.update_observation(state);
            if self.step_counter > 0 {
                agent.update_reward(state, &agent_rewards);
            }
            agent_rewards.insert(agent.name().to_string(), agent.reward_function.current_reward);
        }
    }

    pub fn calculate_truncated(&self) -> bool {
        self.step_counter >= self.settings.max_episode_length
    }

    /// One flag per action in the agent's map: whether its request would pass
    /// every validator right now
    pub fn action_mask(&self, agent_name: &str) -> Result<Vec<bool>, ConfigError> {
        let agent = self
            .agent(agent_name)
            .ok_or_else(|| ConfigError::UnknownAgent(agent_name.to_string()))?;
        let context = RequestContext::for_agent(self.step_counter, agent_name);
        Ok(agent
            .action_manager
            .actions()
            .map(|(_, config)| {
                agent
                    .format_request(&config.action, &config.options)
                    .map_or(false, |request| self.simulation.check_valid_request(&request, &context))
            })
            .collect())
    }

    /// Start a new episode from the simulation as it was when the game was built
    pub fn reset(&mut self) {
        info!("resetting game after {} steps", self.step_counter);
        self.simulation.reset_to(&self.initial_simulation);
        self.step_counter = 0;
        for agent in &mut self.agents {
            agent.reset();
        }
    }
}
