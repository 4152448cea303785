//! main.rs — Fleet telemetry simulator entry point
//!
//! Drives a synthetic fleet of monitored devices against a running
//! SignalMesh backend:
//!   1. Builds the fleet from fleet.toml (or a round-robin mix via --devices)
//!   2. Ticks every device at the configured rate
//!   3. Sends each measurement to the backend ingest hub via UDP
//!
//! The sim runs independently of the backend: if nothing is listening the
//! datagrams vanish and the sim keeps going.

mod device_sim;
mod scenarios;
mod udp_tx;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::time::interval;
use tracing::{info, warn};

use device_sim::DeviceSim;
use scenarios::FleetConfig;
use udp_tx::UdpTransmitter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "fleet-sim", about = "SignalMesh fleet telemetry simulator")]
struct Args {
    /// Fleet config file path
    #[arg(short, long, default_value = "fleet.toml")]
    config: String,
    /// Backend ingest hub UDP address
    #[arg(long, default_value = "127.0.0.1:5577")]
    hub_addr: String,
    /// Device count when no config file is present (round-robin scenarios)
    #[arg(long, default_value = "8")]
    devices: usize,
    /// Measurements per device per second
    #[arg(long, default_value = "1.0")]
    rate_hz: f64,
    /// Agent identifier reported in every envelope
    #[arg(long, default_value = "sim-agent-01")]
    agent_id: String,
    /// Stop after this many ticks (0 = run forever)
    #[arg(long, default_value = "0")]
    ticks: u64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn load_fleet(args: &Args) -> FleetConfig {
    match std::fs::read_to_string(&args.config) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(fleet) => {
                info!("Loaded fleet config from {}", args.config);
                fleet
            }
            Err(e) => {
                warn!("Failed to parse {}: {e} — using round-robin fleet", args.config);
                FleetConfig::round_robin(args.devices)
            }
        },
        Err(_) => {
            info!(
                "No {} found — simulating {} round-robin device(s)",
                args.config, args.devices
            );
            FleetConfig::round_robin(args.devices)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let fleet = load_fleet(&args);

    info!(
        "🛰  Fleet simulator: {} device(s) → {} at {} Hz",
        fleet.devices.len(),
        args.hub_addr,
        args.rate_hz
    );
    for spec in &fleet.devices {
        info!("  {} — {:?} (base {} dBm)", spec.id, spec.scenario, spec.base_rssi);
    }

    let mut tx = match UdpTransmitter::new(&args.hub_addr, &args.agent_id) {
        Ok(tx) => tx,
        Err(e) => {
            warn!("Could not open UDP socket: {e}");
            return;
        }
    };

    let mut sims: Vec<DeviceSim> = fleet
        .devices
        .iter()
        .enumerate()
        .map(|(i, spec)| DeviceSim::new(spec.clone(), fleet.degrade_over_ticks, i as u64 + 1))
        .collect();

    let period = Duration::from_secs_f64(1.0 / args.rate_hz.max(0.01));
    let mut ticker = interval(period);
    let mut tick: u64 = 0;

    loop {
        ticker.tick().await;
        let timestamp = now_ms();
        for sim in &mut sims {
            tx.send(sim.next_measurement(timestamp));
        }
        tick += 1;
        if tick % 30 == 0 {
            info!("tick {tick}: {} measurement(s) sent", tick * sims.len() as u64);
        }
        if args.ticks > 0 && tick >= args.ticks {
            info!("Reached {} tick(s), stopping", args.ticks);
            break;
        }
    }
}
