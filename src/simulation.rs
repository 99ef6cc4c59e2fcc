//! Simulation driver
//!
//! Wraps the network with the two-pass timestep lifecycle and the top of the
//! request tree. Requests that need network round trips answer `pending`;
//! the simulation then delivers all traffic and asks the same path again in
//! the settling phase, so callers always see a final status.

use serde_json::{json, Value};

use crate::config::SimConfig;
use crate::error::RequestError;
use crate::network::Network;
use crate::request::{RequestContext, RequestHandler, RequestManager, RequestResponse, RequestToken, RequestType};

#[derive(Debug, Clone)]
pub struct Simulation {
    pub network: Network,
    config: SimConfig,
    timestep: u64,
    request_manager: RequestManager<Simulation>,
}

impl Simulation {
    pub fn new(network: Network, config: SimConfig) -> Self {
        Self {
            network,
            config,
            timestep: 0,
            request_manager: simulation_request_manager(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    /// Dispatch a request and carry it through to a final status
    pub fn apply_request(
        &mut self,
        request: &[RequestToken],
        context: &RequestContext,
    ) -> Result<RequestResponse, RequestError> {
        let response = self.handle_request(&mut (), request, context)?;
        self.network.flush();
        if !response.is_pending() {
            return Ok(response);
        }
        let settled = self.handle_request(&mut (), request, &context.settling())?;
        self.network.flush();
        if settled.is_pending() {
            return Ok(RequestResponse::failure().with_reason("request did not settle"));
        }
        Ok(settled)
    }

    pub fn check_valid_request(&self, request: &[RequestToken], context: &RequestContext) -> bool {
        self.check_valid(&(), request, context)
    }

    pub fn pre_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
        self.network.pre_timestep(timestep);
    }

    pub fn apply_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
        self.network.apply_timestep(timestep);
    }

    pub fn describe_state(&self) -> Value {
        json!({
            "timestep": self.timestep,
            "network": self.network.describe_state(),
        })
    }

    /// Independent deep copy of the whole simulation; later changes to either
    /// side are never seen by the other
    pub fn snapshot(&self) -> Simulation {
        self.clone()
    }

    pub fn reset_to(&mut self, snapshot: &Simulation) {
        *self = snapshot.clone();
    }
}

impl RequestHandler for Simulation {
    fn request_manager(&self) -> &RequestManager<Self> {
        &self.request_manager
    }
}

fn simulation_request_manager() -> RequestManager<Simulation> {
    fn network(sim: &mut Simulation, _: &mut (), request: &[RequestToken], context: &RequestContext) -> Result<RequestResponse, RequestError> {
        sim.network.handle_request(&mut (), request, context)
    }
    fn descend_network(sim: &Simulation, _: &(), request: &[RequestToken], context: &RequestContext) -> bool {
        sim.network.check_valid(&(), request, context)
    }
    fn do_nothing(_: &mut Simulation, _: &mut (), _: &[RequestToken], _: &RequestContext) -> Result<RequestResponse, RequestError> {
        Ok(RequestResponse::success())
    }

    RequestManager::new()
        .with("network", RequestType::route(network, descend_network))
        .with("do_nothing", RequestType::new(do_nothing))
}
