mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliConfig;
use std::path::PathBuf;
use swap_core::{SwapError, SwapManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "htlc-swap")]
#[command(about = "Resumable HTLC atomic swaps between a UTXO chain and an account chain")]
#[command(version)]
struct Cli {
    /// Data directory for swap storage
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Flow configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted swaps
    List,
    /// Show the full state of a swap
    Show {
        /// Swap ID
        swap_id: String,
    },
    /// Forget a swap
    Abandon {
        /// Swap ID
        swap_id: String,
        /// Skip the open-lock warning
        #[arg(short, long)]
        force: bool,
    },
    /// Run both sides of a swap in-process against simulated chains
    Demo(commands::DemoArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "htlc_swap={level},swap_core={level}",
            level = log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<SwapError>() {
            Some(SwapError::SwapNotFound(id)) => {
                eprintln!("Error: Swap '{}' not found", id);
                eprintln!("Use 'htlc-swap list' to see persisted swaps");
            }
            Some(SwapError::Config(msg)) => {
                eprintln!("Error: Invalid flow config: {}", msg);
            }
            Some(SwapError::RefundNotAvailable { unlocks_at }) => {
                eprintln!("Error: Refund not available before {}", unlocks_at);
            }
            Some(fault) if fault.is_protocol_fault() => {
                eprintln!("Error: {}", fault);
                eprintln!("The swap was left at its current step; inspect it with 'htlc-swap show'");
            }
            _ => {
                eprintln!("Error: {:#}", e);
            }
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CliConfig::load(cli.data_dir, cli.config.as_deref()).await?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let manager = SwapManager::with_config(&config.data_dir, config.flow.clone()).await?;

    match cli.command {
        Commands::List => commands::handle_list(&manager).await,
        Commands::Show { swap_id } => commands::handle_show(&manager, &swap_id).await,
        Commands::Abandon { swap_id, force } => {
            commands::handle_abandon(&manager, &swap_id, force).await
        }
        Commands::Demo(args) => commands::handle_demo(args, &config).await,
    }
}
