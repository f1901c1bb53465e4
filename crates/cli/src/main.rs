//! steploop CLI: the main entry point.
//!
//! Commands:
//! - `run`    : replay a scripted session against the demo tools
//! - `tools`  : list the demo tools and their input schemas
//! - `config` : show the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "steploop",
    about = "steploop: multi-step tool-calling loop over a scripted model",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of ~/.steploop/config.toml
    #[arg(long, global = true, env = "STEPLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON script and print the aggregate result
    Run(commands::run::RunArgs),

    /// List the demo tools
    Tools,

    /// Show the effective configuration
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => commands::run::run(args, config_path).await?,
        Commands::Tools => commands::tools::run()?,
        Commands::Config { path } => {
            if path {
                commands::config_cmd::path(config_path);
            } else {
                commands::config_cmd::show(config_path)?;
            }
        }
    }

    Ok(())
}
