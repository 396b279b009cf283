mod config;
mod events;
mod relay;

use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;
use clap::Parser;

use config::RelayConfig;
use keel::PacketLossSimulation;
use relay::Relay;

#[derive(Parser)]
#[command(name = "keel-relay")]
#[command(about = "Message relay built on the keel transport")]
struct Args {
    #[arg(short, long, default_value_t = keel::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value = "", help = "Password clients must present")]
    password: String,

    #[arg(long, default_value = "", help = "Static data pushed to every client")]
    motd: String,

    #[arg(long, default_value_t = 1, help = "Network thread sleep in ms")]
    sleep: u64,

    #[arg(long, default_value_t = 10_000, help = "Connection timeout in ms")]
    timeout: u64,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let global_packet_loss = args.simulate_packet_loss.then(|| PacketLossSimulation {
        enabled: true,
        loss_percent: args.loss_percent / 100.0,
        min_latency_ms: args.min_latency,
        max_latency_ms: args.max_latency,
        jitter_ms: args.jitter,
    });

    let config = RelayConfig {
        port: args.port,
        max_clients: args.max_clients,
        password: args.password.into_bytes(),
        motd: args.motd.into_bytes(),
        thread_sleep_ms: args.sleep,
        timeout_ms: args.timeout,
        global_packet_loss,
    };

    let mut relay = Relay::new(config)?;
    match relay.local_addr() {
        Some(addr) => log::info!("Relay started on {}", addr),
        None => log::info!("Relay started"),
    }
    log::info!("Type 'q' and press enter to stop");
    spawn_console(relay.running());
    relay.run();
    log::info!("Relay shutting down");

    Ok(())
}

/// Reads operator commands from stdin until `q` or end of input.
fn spawn_console(running: Arc<AtomicBool>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim() {
                "q" | "quit" => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                "" => {}
                other => log::warn!("unknown command '{}'", other),
            }
        }
    });
}
