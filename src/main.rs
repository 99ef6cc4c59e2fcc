//! Command-line runner for the network security simulation
//!
//! Builds one of the bundled networks, registers agents and plays a number of
//! game steps, printing what every agent did and what it earned.
//!
//! ```bash
//! netsec-sim --network uc2 --steps 32 --seed 7
//! netsec-sim --network routed --steps 8 --describe
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::{info, warn};
use serde_json::{Map, Value};

use netsec_sim::game::scenarios::{routed_game_config, uc2_game_config};
use netsec_sim::networks::{arcd_uc2_network, client_server_routed};
use netsec_sim::{Game, GameConfig, SimConfig, SimError, Simulation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NetworkChoice {
    /// Two client LANs, web/database/backup servers and a data manipulation attacker
    Uc2,
    /// One client and one server either side of a router
    Routed,
}

#[derive(Parser, Debug)]
#[command(name = "netsec-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Which bundled network to build
    #[arg(short = 'n', long, value_enum, default_value = "uc2")]
    network: NetworkChoice,

    /// Number of game steps to play
    #[arg(short = 's', long, default_value = "32")]
    steps: u64,

    /// Seed for probabilistic agents; overrides the configuration file
    #[arg(long)]
    seed: Option<u64>,

    /// Simulation settings as JSON
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Agent line-up as JSON; defaults to the bundled one for the network
    #[arg(short = 'g', long)]
    game: Option<PathBuf>,

    /// Log every request and frame decision
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print the final simulation state as JSON
    #[arg(long)]
    describe: bool,
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn,netsec_sim=info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(error) = run(&args) {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), SimError> {
    let mut config = match &args.config {
        Some(path) => SimConfig::from_json_file(path)?,
        None => SimConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.game.seed = seed;
    }

    let (network, game_config) = match args.network {
        NetworkChoice::Uc2 => (arcd_uc2_network(&config)?, uc2_game_config()?),
        NetworkChoice::Routed => (client_server_routed(&config)?, routed_game_config()?),
    };
    let game_config = match &args.game {
        Some(path) => GameConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => game_config,
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║          Network Security Simulation: scripted game              ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    info!(
        "network={:?} nodes={} links={} seed={}",
        args.network,
        network.nodes().count(),
        network.links().len(),
        config.game.seed
    );

    let simulation = Simulation::new(network, config);
    let mut game = Game::from_config(simulation, &game_config)?;

    println!("Agents (reward order): {}", game.reward_calculation_order().join(", "));
    println!();

    for _ in 0..args.steps {
        script_defender(&mut game);
        game.step()?;
        print_step(&game);
        if game.calculate_truncated() {
            warn!("episode truncated at step {}", game.step_counter());
            break;
        }
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("SUMMARY after {} steps", game.step_counter());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for agent in game.agents() {
        let successes = agent.history().iter().filter(|item| item.response.is_success()).count();
        println!(
            "  {:<28} total reward {:>8.3}   {}/{} actions succeeded",
            agent.name(),
            agent.reward_function.total_reward,
            successes,
            agent.history().len()
        );
    }

    if args.describe {
        println!();
        println!("{}", serde_json::to_string_pretty(&game.get_sim_state())?);
    }
    Ok(())
}

/// Scan the database file every third step and restore it on the step after
/// a scan shows it corrupt. Does nothing when there is no controlled defender.
fn script_defender(game: &mut Game) {
    let step = game.step_counter();
    let visible_status = game
        .get_sim_state()
        .pointer("/network/nodes/database_server/file_system/folders/database/files/database.db/visible_status")
        .and_then(Value::as_u64);
    let Some(defender) = game.agent_mut("defender") else {
        return;
    };

    let file_options = || {
        let mut options = Map::new();
        options.insert("node_name".to_string(), Value::from("database_server"));
        options.insert("folder_name".to_string(), Value::from("database"));
        options.insert("file_name".to_string(), Value::from("database.db"));
        options
    };
    match (visible_status, step % 3) {
        (Some(_), 0) => {
            defender.store_action("node-file-scan", file_options());
        }
        (Some(3), 1) => {
            defender.store_action("node-file-restore", file_options());
        }
        (None, 0) => {
            let mut options = Map::new();
            options.insert("node_name".to_string(), Value::from("server_1"));
            defender.store_action("node-os-scan", options);
        }
        _ => {}
    }
}

fn print_step(game: &Game) {
    println!("step {:>3}", game.step_counter());
    for agent in game.agents() {
        let Some(last) = agent.last_action() else {
            continue;
        };
        println!(
            "    {:<28} {:<28} {:<8} reward {:>7.3}",
            agent.name(),
            last.action,
            last.response.status.to_string(),
            agent.reward_function.current_reward
        );
    }
}
