// Network Security Simulation Library
// Nodes, software, traffic and agents for blue/red training environments

pub mod acl;
pub mod applications;
pub mod config;
pub mod error;
pub mod file_system;
pub mod frame;
pub mod game;
pub mod interface;
pub mod network;
pub mod networks;
pub mod node;
pub mod packet_capture;
pub mod protocols;
pub mod request;
pub mod services;
pub mod simulation;
pub mod software;
pub mod software_manager;
pub mod sys_log;

pub use acl::*;
pub use config::*;
pub use error::*;
pub use file_system::*;
pub use frame::*;
pub use game::{Agent, AgentConfig, AgentKind, Game, GameConfig};
pub use network::*;
pub use node::{Node, NodeKind, NodeOperatingState};
pub use request::*;
pub use simulation::*;
pub use sys_log::*;

/// Advance a multi-step countdown by one timestep.
///
/// Returns true on the step the countdown completes; `Some(n)` completes on
/// the n-th call.
pub(crate) fn tick_countdown(countdown: &mut Option<u32>) -> bool {
    match countdown {
        Some(remaining) if *remaining > 1 => {
            *remaining -= 1;
            false
        }
        Some(_) => {
            *countdown = None;
            true
        }
        None => false,
    }
}
