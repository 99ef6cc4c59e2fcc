//! Applications: software an agent runs, closes and executes
//!
//! Applications are installed CLOSED. `execute` performs the application's
//! one action (fetch a page, query the database, advance an attack); when
//! the result depends on traffic still in flight it answers `pending` and is
//! settled once the network has been flushed.

pub mod c2;
pub mod data_manipulation_bot;
pub mod database_client;
pub mod web_browser;

pub use c2::*;
pub use data_manipulation_bot::*;
pub use database_client::*;
pub use web_browser::*;

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{SoftwareConfig, SoftwareTimings};
use crate::error::{ConfigError, RequestError};
use crate::frame::{IpProtocol, Port, HTTP_PORT, POSTGRES_PORT};
use crate::request::{
    options, RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken, RequestType,
};
use crate::software::{
    InboundPayload, NodeContext, SoftwareBehaviour, SoftwareCore, SoftwareEvent, SoftwareHealthState, SoftwareOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApplicationOperatingState {
    Running = 1,
    Closed = 2,
    Installing = 3,
}

impl fmt::Display for ApplicationOperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationOperatingState::Running => write!(f, "RUNNING"),
            ApplicationOperatingState::Closed => write!(f, "CLOSED"),
            ApplicationOperatingState::Installing => write!(f, "INSTALLING"),
        }
    }
}

/// Result of an application's `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed(bool),
    /// Waiting on traffic; settle later
    Pending,
}

// ============================================================================
// APPLICATION KINDS
// ============================================================================

pub const APPLICATION_TYPE_TAGS: [&str; 5] = [
    "web-browser",
    "database-client",
    "data-manipulation-bot",
    "c2-server",
    "c2-beacon",
];

#[derive(Debug, Clone)]
pub enum ApplicationKind {
    WebBrowser(WebBrowser),
    DatabaseClient(DatabaseClient),
    DataManipulationBot(DataManipulationBot),
    C2Server(C2Server),
    C2Beacon(C2Beacon),
}

impl ApplicationKind {
    pub fn is_application_tag(tag: &str) -> bool {
        APPLICATION_TYPE_TAGS.contains(&tag)
    }

    pub fn from_config(config: &SoftwareConfig) -> Result<Self, ConfigError> {
        let tag = config.software_type.as_str();
        let options = SoftwareOptions::new(tag, &config.options);
        let kind = match tag {
            "web-browser" => ApplicationKind::WebBrowser(WebBrowser::from_options(&options)?),
            "database-client" => ApplicationKind::DatabaseClient(DatabaseClient::from_options(&options)?),
            "data-manipulation-bot" => ApplicationKind::DataManipulationBot(DataManipulationBot::from_options(&options)?),
            "c2-server" => ApplicationKind::C2Server(C2Server::default()),
            "c2-beacon" => ApplicationKind::C2Beacon(C2Beacon::from_options(&options)?),
            other => return Err(ConfigError::UnknownApplicationType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn from_type_tag(tag: &str) -> Result<Self, ConfigError> {
        Self::from_config(&SoftwareConfig::new(tag))
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ApplicationKind::WebBrowser(_) => "web-browser",
            ApplicationKind::DatabaseClient(_) => "database-client",
            ApplicationKind::DataManipulationBot(_) => "data-manipulation-bot",
            ApplicationKind::C2Server(_) => "c2-server",
            ApplicationKind::C2Beacon(_) => "c2-beacon",
        }
    }

    pub fn binding(&self) -> (Option<Port>, IpProtocol) {
        match self {
            ApplicationKind::WebBrowser(_) => (Some(HTTP_PORT), IpProtocol::Tcp),
            ApplicationKind::DatabaseClient(_) => (Some(POSTGRES_PORT), IpProtocol::Tcp),
            ApplicationKind::DataManipulationBot(_) | ApplicationKind::C2Server(_) | ApplicationKind::C2Beacon(_) => {
                (None, IpProtocol::Tcp)
            }
        }
    }

    fn behaviour(&self) -> &dyn SoftwareBehaviour {
        match self {
            ApplicationKind::WebBrowser(inner) => inner,
            ApplicationKind::DatabaseClient(inner) => inner,
            ApplicationKind::DataManipulationBot(inner) => inner,
            ApplicationKind::C2Server(inner) => inner,
            ApplicationKind::C2Beacon(inner) => inner,
        }
    }

    fn behaviour_mut(&mut self) -> &mut dyn SoftwareBehaviour {
        match self {
            ApplicationKind::WebBrowser(inner) => inner,
            ApplicationKind::DatabaseClient(inner) => inner,
            ApplicationKind::DataManipulationBot(inner) => inner,
            ApplicationKind::C2Server(inner) => inner,
            ApplicationKind::C2Beacon(inner) => inner,
        }
    }
}

// ============================================================================
// APPLICATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct Application {
    pub core: SoftwareCore,
    operating_state: ApplicationOperatingState,
    num_executions: u32,
    kind: ApplicationKind,
    request_manager: RequestManager<Application, NodeContext>,
}

impl Application {
    pub fn new(kind: ApplicationKind, timings: SoftwareTimings) -> Self {
        let (port, protocol) = kind.binding();
        let request_manager = application_request_manager(&kind);
        Self {
            core: SoftwareCore::new(kind.type_tag(), port, protocol, timings.fixing_duration),
            operating_state: ApplicationOperatingState::Closed,
            num_executions: 0,
            kind,
            request_manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn operating_state(&self) -> ApplicationOperatingState {
        self.operating_state
    }

    pub fn num_executions(&self) -> u32 {
        self.num_executions
    }

    pub fn kind(&self) -> &ApplicationKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ApplicationKind {
        &mut self.kind
    }

    pub fn can_perform_action(&self, ctx: &NodeContext) -> bool {
        ctx.operational && self.operating_state == ApplicationOperatingState::Running
    }

    pub fn run(&mut self, ctx: &mut NodeContext) -> bool {
        if !ctx.operational {
            ctx.sys_log.error(format!("Unable to run application {}. Node is not on.", self.core.name));
            return false;
        }
        if self.operating_state == ApplicationOperatingState::Running {
            return false;
        }
        ctx.sys_log.info(format!("Running application {}", self.core.name));
        self.operating_state = ApplicationOperatingState::Running;
        if self.core.health_state_actual == SoftwareHealthState::Unused {
            self.core.set_health_state(SoftwareHealthState::Good);
        }
        true
    }

    pub fn close(&mut self, ctx: &mut NodeContext) -> bool {
        if self.operating_state != ApplicationOperatingState::Running {
            return false;
        }
        ctx.sys_log.info(format!("Closing application {}", self.core.name));
        self.operating_state = ApplicationOperatingState::Closed;
        true
    }

    /// Perform the application's action
    pub fn execute(&mut self, ctx: &mut NodeContext) -> ExecuteOutcome {
        // red software opens itself when told to act
        let opens_itself = matches!(
            self.kind,
            ApplicationKind::DataManipulationBot(_) | ApplicationKind::C2Beacon(_)
        );
        if opens_itself && !self.can_perform_action(ctx) {
            self.run(ctx);
        }
        if !self.can_perform_action(ctx) {
            ctx.sys_log
                .warning(format!("Unable to execute {}, application is {}", self.core.name, self.operating_state));
            return ExecuteOutcome::Completed(false);
        }
        self.num_executions += 1;
        let Application { core, kind, .. } = self;
        match kind {
            ApplicationKind::WebBrowser(browser) => browser.get_webpage(core, ctx),
            ApplicationKind::DatabaseClient(client) => client.execute(core, ctx),
            ApplicationKind::DataManipulationBot(bot) => ExecuteOutcome::Completed(bot.attack(core, ctx)),
            ApplicationKind::C2Server(server) => ExecuteOutcome::Completed(server.is_connected()),
            ApplicationKind::C2Beacon(beacon) => {
                if beacon.establish(core, ctx) {
                    ExecuteOutcome::Pending
                } else {
                    ExecuteOutcome::Completed(false)
                }
            }
        }
    }

    /// Final outcome of the last `execute` once traffic has been delivered
    pub fn execute_succeeded(&self) -> bool {
        match &self.kind {
            ApplicationKind::WebBrowser(browser) => browser.last_page_loaded(),
            ApplicationKind::DatabaseClient(client) => client.last_query_succeeded(),
            ApplicationKind::DataManipulationBot(bot) => bot.attack_stage() == DataManipulationAttackStage::Succeeded,
            ApplicationKind::C2Server(server) => server.is_connected(),
            ApplicationKind::C2Beacon(beacon) => beacon.is_connected(),
        }
    }

    pub(crate) fn install(&mut self, ctx: &mut NodeContext) {
        let Application { core, kind, .. } = self;
        kind.behaviour_mut().on_install(core, ctx);
    }

    pub fn receive(&mut self, ctx: &mut NodeContext, inbound: &InboundPayload) -> bool {
        if !self.can_perform_action(ctx) {
            ctx.sys_log
                .debug(format!("{} dropped payload, application is {}", self.core.name, self.operating_state));
            return false;
        }
        self.core.payloads_received += 1;
        let Application { core, kind, .. } = self;
        kind.behaviour_mut().receive(core, ctx, inbound)
    }

    pub fn on_event(&mut self, ctx: &mut NodeContext, event: &SoftwareEvent) -> bool {
        if !self.can_perform_action(ctx) {
            return false;
        }
        let Application { core, kind, .. } = self;
        kind.behaviour_mut().on_event(core, ctx, event)
    }

    pub fn network_idle(&mut self, ctx: &mut NodeContext) {
        if !self.can_perform_action(ctx) {
            return;
        }
        let Application { core, kind, .. } = self;
        kind.behaviour_mut().on_network_idle(core, ctx);
        if let ApplicationKind::C2Beacon(beacon) = kind {
            if beacon.take_connection_lost() {
                self.close(ctx);
            }
        }
    }

    pub fn apply_timestep(&mut self, ctx: &mut NodeContext) {
        if self.core.tick_fix(&mut ctx.sys_log) && self.can_perform_action(ctx) {
            let Application { core, kind, .. } = self;
            kind.behaviour_mut().on_fixed(core, ctx);
        }
        if self.can_perform_action(ctx) {
            let Application { core, kind, .. } = self;
            kind.behaviour_mut().apply_timestep(core, ctx);
        }
    }

    pub fn describe_state(&self) -> Value {
        let mut state: Map<String, Value> = self.core.describe_state();
        state.insert("type".to_string(), Value::from(self.kind.type_tag()));
        state.insert("operating_state".to_string(), Value::from(self.operating_state as u8));
        state.insert("num_executions".to_string(), Value::from(self.num_executions));
        self.kind.behaviour().describe_state(&mut state);
        Value::Object(state)
    }
}

impl RequestHandler<NodeContext> for Application {
    fn request_manager(&self) -> &RequestManager<Self, NodeContext> {
        &self.request_manager
    }
}

fn application_request_manager(kind: &ApplicationKind) -> RequestManager<Application, NodeContext> {
    fn scan(app: &mut Application, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(app.core.scan(&mut ctx.sys_log)))
    }
    fn fix(app: &mut Application, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(app.core.fix(&mut ctx.sys_log)))
    }
    fn run(app: &mut Application, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(app.run(ctx)))
    }
    fn close(app: &mut Application, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(app.close(ctx)))
    }
    fn execute(app: &mut Application, ctx: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        match app.execute(ctx) {
            ExecuteOutcome::Completed(success) => Ok(RequestResponse::from_bool(success)),
            ExecuteOutcome::Pending => Ok(RequestResponse::pending()),
        }
    }
    fn execute_settled(app: &mut Application, _: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::from_bool(app.execute_succeeded()))
    }


    // [{c2_server_ip_address, keep_alive_frequency, masquerade_protocol, masquerade_port}]
    fn configure(app: &mut Application, ctx: &mut NodeContext, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        let options = options(request);
        let settings = match BeaconSettings::from_options(&SoftwareOptions::new("c2-beacon", &options)) {
            Ok(settings) => settings,
            Err(error) => return Ok(RequestResponse::failure().with_reason(error.to_string())),
        };
        let Application { core, kind, .. } = app;
        let ApplicationKind::C2Beacon(beacon) = kind else {
            return Ok(RequestResponse::failure());
        };
        Ok(RequestResponse::from_bool(beacon.configure(core, ctx, settings)))
    }

    // the remaining tokens are the request the beacon applies on its node
    fn command(app: &mut Application, ctx: &mut NodeContext, request: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        if request.is_empty() {
            return Err(RequestError::MissingArgument {
                request: "command",
                argument: "request",
            });
        }
        if !app.can_perform_action(ctx) {
            return Ok(RequestResponse::failure().with_reason("application is not running"));
        }
        let Application { core, kind, .. } = app;
        let ApplicationKind::C2Server(server) = kind else {
            return Ok(RequestResponse::failure());
        };
        if !server.send_command(core, ctx, request.to_vec()) {
            return Ok(server.command_response());
        }
        Ok(RequestResponse::pending())
    }
    fn command_settled(app: &mut Application, _: &mut NodeContext, _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        match &app.kind {
            ApplicationKind::C2Server(server) => Ok(server.command_response()),
            _ => Ok(RequestResponse::failure()),
        }
    }

    let manager = RequestManager::new()
        .with("scan", RequestType::new(scan))
        .with("fix", RequestType::new(fix))
        .with("run", RequestType::new(run))
        .with("close", RequestType::new(close))
        .with("execute", RequestType::new(execute).with_settle(execute_settled));

    match kind {
        ApplicationKind::C2Beacon(_) => manager.with("configure", RequestType::new(configure)),
        ApplicationKind::C2Server(_) => manager.with("command", RequestType::new(command).with_settle(command_settled)),
        _ => manager,
    }
}
