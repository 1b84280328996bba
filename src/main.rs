use clap::{Parser, Subcommand};
use flowgate::{ControllerChain, FlowConfig};
use tracing_subscriber::EnvFilter;

/// Flowgate — request flow control for API gateways
#[derive(Parser)]
#[command(name = "flowgate", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without building the chain
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "flow.hcl")]
        config: String,
    },
    /// Print the resolved controller order for a configuration file
    Plan {
        /// Path to configuration file
        #[arg(short, long, default_value = "flow.hcl")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> flowgate::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Validate { config } => {
            let parsed = FlowConfig::from_file(&config).await?;
            parsed.validate()?;
            println!(
                "✓ Configuration valid: {} controller(s), {}ms admission budget",
                parsed.controllers.len(),
                parsed.timeout_ms
            );
        }
        Commands::Plan { config } => {
            let parsed = FlowConfig::from_file(&config).await?;
            let chain = ControllerChain::from_config(&parsed)?;
            println!("Admission order ({}ms budget):", parsed.timeout_ms);
            for (index, name) in chain.controller_names().iter().enumerate() {
                println!("  {}. {}", index + 1, name);
            }
        }
    }

    Ok(())
}
