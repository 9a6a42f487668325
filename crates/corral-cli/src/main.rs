mod orchestrate_cmd;

use clap::{ArgGroup, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "corral",
    about = "Card-driven orchestrator for fleets of parallel coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Decompose a card into parallel coding agents and drive it to a PR
    #[command(group(ArgGroup::new("target").required(true).multiple(false)))]
    Orchestrate {
        /// Orchestrate a specific card
        #[arg(long, group = "target")]
        card_id: Option<String>,
        /// Watch the trigger list for new cards
        #[arg(long, group = "target")]
        watch: bool,
        /// Maximum number of concurrent agents
        #[arg(long, default_value_t = 3)]
        max_agents: usize,
        /// Seconds between poll cycles
        #[arg(long, default_value_t = 30)]
        poll_interval: u64,
        /// Wall-clock budget per agent in seconds
        #[arg(long, default_value_t = 900)]
        agent_timeout: u64,
        /// Verbose output
        #[arg(long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Orchestrate { debug: true, .. } => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Orchestrate {
            card_id,
            watch,
            max_agents,
            poll_interval,
            agent_timeout,
            debug: _,
        } => {
            orchestrate_cmd::run_orchestrate(
                card_id.as_deref(),
                watch,
                max_agents,
                poll_interval,
                agent_timeout,
            )
            .await
        }
    }
}
