// Data manipulation walkthrough on the UC2 network
// The bot on client_1 attacks the database, the green user's web page breaks,
// and fixing the database service restores the file from its backup.

use std::time::Instant;

use netsec_sim::networks::arcd_uc2_network;
use netsec_sim::{request, Request, RequestContext, RequestResponse, SimConfig, SimError, Simulation};
use serde_json::Value;

const DB_HEALTH: &str = "/network/nodes/database_server/file_system/folders/database/files/database.db/health_status";

fn apply(sim: &mut Simulation, request: Request) -> Result<RequestResponse, SimError> {
    let context = RequestContext::for_agent(sim.timestep(), "demo");
    Ok(sim.apply_request(&request, &context)?)
}

fn step(sim: &mut Simulation) {
    let timestep = sim.timestep();
    sim.pre_timestep(timestep);
    sim.apply_timestep(timestep + 1);
}

fn db_health(sim: &Simulation) -> u64 {
    sim.describe_state().pointer(DB_HEALTH).and_then(Value::as_u64).unwrap_or(0)
}

fn browse(sim: &mut Simulation) -> Result<bool, SimError> {
    let response = apply(sim, request!["network", "node", "client_2", "application", "web-browser", "execute"])?;
    Ok(response.is_success())
}

fn main() -> Result<(), SimError> {
    println!("UC2 Data Manipulation Demo");
    println!("==========================\n");

    let config = SimConfig::default();
    let build_start = Instant::now();
    let mut sim = Simulation::new(arcd_uc2_network(&config)?, config);
    println!("Built {} nodes in {:?}", sim.network.hostnames().len(), build_start.elapsed());

    step(&mut sim);
    println!("t={} database backed up, file health {}", sim.timestep(), db_health(&sim));
    println!("t={} client_2 browsing ok: {}\n", sim.timestep(), browse(&mut sim)?);

    println!("Attack phase");
    println!("------------");
    let attack_start = Instant::now();
    while db_health(&sim) == 1 && sim.timestep() < 20 {
        let response = apply(
            &mut sim,
            request!["network", "node", "client_1", "application", "data-manipulation-bot", "execute"],
        )?;
        println!("t={} bot execute: {}", sim.timestep(), response.status);
        step(&mut sim);
    }
    println!(
        "database file health {} after {:?}; client_2 browsing ok: {}\n",
        db_health(&sim),
        attack_start.elapsed(),
        browse(&mut sim)?
    );

    println!("Recovery phase");
    println!("--------------");
    let fix = apply(
        &mut sim,
        request!["network", "node", "database_server", "service", "database-service", "fix"],
    )?;
    println!("t={} database-service fix: {}", sim.timestep(), fix.status);
    for _ in 0..=sim.config().software.fixing_duration {
        step(&mut sim);
    }
    println!("t={} database file health {}", sim.timestep(), db_health(&sim));
    println!("t={} client_2 browsing ok: {}", sim.timestep(), browse(&mut sim)?);

    Ok(())
}
