mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use linkkeeper_protocol::DisconnectReason;

// ============================================================================
// CLI Types
// ============================================================================

/// linkkeeper - Supervisor for long-lived messaging protocol sessions
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the configured tenant sessions until interrupted
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "linkkeeper.yaml")]
        config: String,
    },

    /// Print the effective recovery policy table
    Policy {
        /// Path to configuration file
        #[arg(short, long, default_value = "linkkeeper.yaml")]
        config: String,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Classify a connection failure and show the recovery it would get
    Classify {
        /// Protocol disconnect reason (e.g. logged_out, timed_out)
        #[arg(long, value_parser = parse_reason)]
        reason: Option<DisconnectReason>,

        /// Transport status code
        #[arg(long)]
        status: Option<u16>,

        /// Free-text error message
        #[arg(long)]
        message: Option<String>,

        /// Path to configuration file
        #[arg(short, long, default_value = "linkkeeper.yaml")]
        config: String,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

fn parse_reason(value: &str) -> Result<DisconnectReason, String> {
    DisconnectReason::ALL
        .into_iter()
        .find(|reason| reason.as_str() == value)
        .ok_or_else(|| {
            let known: Vec<_> = DisconnectReason::ALL.iter().map(|r| r.as_str()).collect();
            format!("unknown reason '{value}' (expected one of: {})", known.join(", "))
        })
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => commands::serve::run(&config).await,
        Commands::Policy { config, format } => commands::policy::run(&config, &format).await,
        Commands::Classify {
            reason,
            status,
            message,
            config,
            format,
        } => commands::classify::run(reason, status, message, &config, &format).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
