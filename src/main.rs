use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "onboard")]
#[command(version, about = "Guided Azure onboarding for Cortex Cloud")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to onboard.toml. Defaults to ./onboard.toml when present.
    #[arg(short, long, global = true, env = "ONBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the onboarding HTTP and WebSocket service
    Serve {
        /// Address to bind (overrides config and ONBOARD_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Pretend to run az and terraform instead of invoking them
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that the Azure CLI and Terraform are installed and logged in
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate an onboarding config file and write terraform.tfvars
    Render {
        /// JSON file in the start-onboarding request format
        #[arg(short, long)]
        input: PathBuf,

        /// Directory to write terraform.tfvars into
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dry_run,
        } => cmd::cmd_serve(&cli, host.clone(), *port, *dry_run).await?,
        Commands::Check { json } => cmd::cmd_check(&cli, *json).await?,
        Commands::Render { input, out } => cmd::cmd_render(input, out).await?,
    }

    Ok(())
}
