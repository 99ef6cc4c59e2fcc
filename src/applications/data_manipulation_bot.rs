//! Red-team bot that tampers with a database through the host's database client
//!
//! Each `execute` advances the attack one pass: log on, then a port scan and
//! the data manipulation itself, each gated by a Bernoulli trial drawn from
//! the node's seeded RNG. The manipulation query completes asynchronously.

use std::fmt;
use std::net::Ipv4Addr;

use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::software::{DatabaseQuery, NodeContext, SoftwareBehaviour, SoftwareCore, SoftwareEvent, SoftwareOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataManipulationAttackStage {
    NotStarted = 0,
    Logon = 1,
    PortScan = 2,
    Attacking = 3,
    Succeeded = 4,
    Failed = 5,
}

impl fmt::Display for DataManipulationAttackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataManipulationAttackStage::NotStarted => write!(f, "NOT_STARTED"),
            DataManipulationAttackStage::Logon => write!(f, "LOGON"),
            DataManipulationAttackStage::PortScan => write!(f, "PORT_SCAN"),
            DataManipulationAttackStage::Attacking => write!(f, "ATTACKING"),
            DataManipulationAttackStage::Succeeded => write!(f, "SUCCEEDED"),
            DataManipulationAttackStage::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataManipulationBot {
    pub server_ip_address: Option<Ipv4Addr>,
    pub server_password: Option<String>,
    pub payload: String,
    pub port_scan_p_of_success: f64,
    pub data_manipulation_p_of_success: f64,
    pub repeat: bool,
    attack_stage: DataManipulationAttackStage,
    pending_request: Option<u64>,
}

impl Default for DataManipulationBot {
    fn default() -> Self {
        Self {
            server_ip_address: None,
            server_password: None,
            payload: "DELETE".to_string(),
            port_scan_p_of_success: 0.1,
            data_manipulation_p_of_success: 0.1,
            repeat: true,
            attack_stage: DataManipulationAttackStage::NotStarted,
            pending_request: None,
        }
    }
}

impl DataManipulationBot {
    pub fn from_options(options: &SoftwareOptions<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bot = Self {
            server_ip_address: options.ip("server_ip")?,
            server_password: options.string("server_password")?,
            payload: options.string("payload")?.unwrap_or(defaults.payload),
            port_scan_p_of_success: options
                .f64("port_scan_p_of_success")?
                .unwrap_or(defaults.port_scan_p_of_success),
            data_manipulation_p_of_success: options
                .f64("data_manipulation_p_of_success")?
                .unwrap_or(defaults.data_manipulation_p_of_success),
            repeat: options.bool("repeat")?.unwrap_or(defaults.repeat),
            ..defaults
        };
        for p in [bot.port_scan_p_of_success, bot.data_manipulation_p_of_success] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!(
                    "data-manipulation-bot: probability {} is outside [0, 1]",
                    p
                )));
            }
        }
        Ok(bot)
    }

    pub fn attack_stage(&self) -> DataManipulationAttackStage {
        self.attack_stage
    }

    fn reset_if_finished(&mut self) {
        if self.repeat
            && matches!(
                self.attack_stage,
                DataManipulationAttackStage::Succeeded | DataManipulationAttackStage::Failed
            )
        {
            self.attack_stage = DataManipulationAttackStage::NotStarted;
        }
    }

    /// One pass of the attack loop; false when the bot is not configured
    pub fn attack(&mut self, core: &SoftwareCore, ctx: &mut NodeContext) -> bool {
        let Some(server_ip_address) = self.server_ip_address else {
            ctx.sys_log.warning(format!(
                "{}: Failed to start as it requires both a target_ip_address and payload.",
                core.name
            ));
            return false;
        };
        if self.payload.is_empty() {
            ctx.sys_log.warning(format!(
                "{}: Failed to start as it requires both a target_ip_address and payload.",
                core.name
            ));
            return false;
        }
        ctx.sys_log.debug(format!("{}: Running", core.name));

        if self.attack_stage == DataManipulationAttackStage::NotStarted {
            self.attack_stage = DataManipulationAttackStage::Logon;
        }

        if self.attack_stage == DataManipulationAttackStage::Logon
            && ctx.rng.gen::<f64>() < self.port_scan_p_of_success
        {
            ctx.sys_log.info(format!("{}: Performing port scan", core.name));
            self.attack_stage = DataManipulationAttackStage::PortScan;
        }

        if self.attack_stage == DataManipulationAttackStage::PortScan
            && ctx.rng.gen::<f64>() < self.data_manipulation_p_of_success
        {
            ctx.sys_log.info(format!("{}: Performing data manipulation", core.name));
            let request_id = ctx.next_id();
            self.pending_request = Some(request_id);
            self.attack_stage = DataManipulationAttackStage::Attacking;
            ctx.emit(SoftwareEvent::DatabaseQueryRequested(DatabaseQuery {
                requester: core.name.clone(),
                request_id,
                query: self.payload.clone(),
                server_ip_address: Some(server_ip_address),
                server_password: self.server_password.clone(),
            }));
        }

        self.reset_if_finished();
        true
    }
}

impl SoftwareBehaviour for DataManipulationBot {
    fn on_event(&mut self, core: &mut SoftwareCore, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        let SoftwareEvent::DatabaseQueryCompleted {
            requester,
            request_id,
            success,
        } = event
        else {
            return false;
        };
        if *requester != core.name || self.pending_request != Some(*request_id) {
            return false;
        }
        self.pending_request = None;
        ctx.sys_log.info(format!("{} payload delivered: {}", core.name, self.payload));
        if *success {
            ctx.sys_log.info(format!("{}: Data manipulation successful", core.name));
            self.attack_stage = DataManipulationAttackStage::Succeeded;
        } else {
            ctx.sys_log.warning(format!("{}: Data manipulation failed", core.name));
            self.attack_stage = DataManipulationAttackStage::Failed;
        }
        self.reset_if_finished();
        false
    }

    fn describe_state(&self, state: &mut Map<String, Value>) {
        state.insert("attack_stage".to_string(), Value::from(self.attack_stage as u8));
    }
}
