use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshrd::config::{NodeConfig, Protocol};
use meshrd::orchestrator::NodeOrchestrator;
use meshrd::transport::BusRegistry;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meshrd")]
#[command(about = "Routing and forwarding core for a small overlay-network node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the node and keep it running.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Optional dotenv-style override file, applied before reading the environment.
    #[arg(long)]
    env: Option<PathBuf>,
    /// Print the routing table once per second for the `--wait` duration.
    #[arg(long)]
    show_table: bool,
    /// Seconds to run before exiting (0 = block on Ctrl-C).
    #[arg(long, default_value_t = 0.0)]
    wait: f64,
    /// Originate one message to this NodeID at startup.
    #[arg(long)]
    send: Option<String>,
    /// Payload for --send.
    #[arg(long, default_value = "hola")]
    body: String,
    /// Overrides LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    if let Some(path) = &args.env {
        meshrd::config::apply_dotenv(path)?;
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));
    init_logging(&log_level)?;

    let cfg = NodeConfig::load(None)?;
    let registry = BusRegistry::new();
    let node = NodeOrchestrator::new(&cfg, &registry);
    node.start()?;

    if let Some(dst) = &args.send {
        node.send(dst.clone(), args.body.clone());
    }

    if args.show_table {
        let iterations = if args.wait > 0.0 { args.wait.round() as u64 } else { 1 };
        for _ in 0..iterations {
            thread::sleep(Duration::from_secs(1));
            print_routing_table(&node, &cfg.my_id, cfg.protocol);
        }
    } else if args.wait > 0.0 {
        thread::sleep(Duration::from_secs_f64(args.wait));
    } else {
        wait_for_ctrl_c()?;
    }

    node.shutdown()?;
    Ok(())
}

fn print_routing_table(node: &NodeOrchestrator, my_id: &str, protocol: Protocol) {
    let routes = node.routing_table();
    println!("routing table for {my_id} ({protocol:?})");
    if routes.is_empty() {
        println!("  (empty)");
        return;
    }
    for (dest, (next_hop, cost)) in routes {
        println!("  {dest:<8} -> {next_hop:<8} cost={cost:.4}");
    }
}

fn wait_for_ctrl_c() -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::Relaxed))?;
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
    Ok(())
}
