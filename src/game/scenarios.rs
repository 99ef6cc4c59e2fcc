//! Prebuilt agent line-ups for the bundled topologies

use serde_json::json;

use super::GameConfig;
use crate::error::Result;

fn green_user(hostname: &str) -> serde_json::Value {
    json!({
        "ref": format!("{}_green_user", hostname),
        "type": "probabilistic-agent",
        "action_probabilities": {"0": 0.3, "1": 0.6, "2": 0.1},
        "action_map": {
            "0": {"action": "do-nothing"},
            "1": {"action": "node-application-execute",
                  "options": {"node_name": hostname, "application_name": "web-browser"}},
            "2": {"action": "node-application-execute",
                  "options": {"node_name": hostname, "application_name": "database-client"}}
        },
        "reward_components": [
            {"type": "webpage-unavailable-penalty", "node_hostname": hostname, "weight": 0.25},
            {"type": "green-admin-database-unreachable-penalty", "node_hostname": hostname, "weight": 0.05}
        ]
    })
}

/// Two green users, the data manipulation attacker on client_1 and a
/// controlled defender scored on database integrity and green experience
pub fn uc2_game_config() -> Result<GameConfig> {
    let config = json!({
        "agents": [
            green_user("client_1"),
            green_user("client_2"),
            {
                "ref": "data_manipulation_attacker",
                "type": "probabilistic-agent",
                "action_probabilities": {"0": 0.8, "1": 0.2},
                "action_map": {
                    "0": {"action": "do-nothing"},
                    "1": {"action": "node-application-execute",
                          "options": {"node_name": "client_1", "application_name": "data-manipulation-bot"}}
                }
            },
            {
                "ref": "defender",
                "type": "controlled-agent",
                "action_map": {
                    "0": {"action": "do-nothing"},
                    "1": {"action": "node-file-scan",
                          "options": {"node_name": "database_server", "folder_name": "database", "file_name": "database.db"}},
                    "2": {"action": "node-file-restore",
                          "options": {"node_name": "database_server", "folder_name": "database", "file_name": "database.db"}},
                    "3": {"action": "node-service-fix",
                          "options": {"node_name": "database_server", "service_name": "database-service"}},
                    "4": {"action": "node-nic-disable", "options": {"node_name": "client_1", "nic_num": 1}},
                    "5": {"action": "node-nic-enable", "options": {"node_name": "client_1", "nic_num": 1}}
                },
                "reward_components": [
                    {"type": "database-file-integrity", "node_hostname": "database_server", "weight": 0.4},
                    {"type": "shared-reward", "agent_name": "client_1_green_user", "weight": 0.5},
                    {"type": "shared-reward", "agent_name": "client_2_green_user", "weight": 0.5}
                ]
            }
        ]
    });
    Ok(serde_json::from_value(config)?)
}

/// A green user wandering between OS scans and a defender paying for every action
pub fn routed_game_config() -> Result<GameConfig> {
    let config = json!({
        "agents": [
            {
                "ref": "green_user",
                "type": "probabilistic-agent",
                "action_map": {
                    "0": {"action": "do-nothing"},
                    "1": {"action": "node-os-scan", "options": {"node_name": "client_1"}},
                    "2": {"action": "node-os-scan", "options": {"node_name": "server_1"}}
                }
            },
            {
                "ref": "defender",
                "type": "controlled-agent",
                "action_map": {
                    "0": {"action": "do-nothing"},
                    "1": {"action": "node-os-scan", "options": {"node_name": "server_1"}}
                },
                "reward_components": [
                    {"type": "action-penalty", "action_penalty": -0.5, "do_nothing_penalty": 0.0}
                ]
            }
        ]
    });
    Ok(serde_json::from_value(config)?)
}
