use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use run_control::{
    init_telemetry, validate_filename, ControlPlane, RunControlConfig, ShutdownCoordinator,
};

#[derive(Parser)]
#[command(name = "run-control")]
#[command(about = "Control plane for workflow runs executed by per-user worker processes")]
#[command(long_about = "run-control admits workflow runs, tracks their lifecycle and drives \
                       per-user worker subprocesses that execute them. Configuration is read from \
                       run-control.toml, .run-control-rc and RUN_CONTROL__* environment variables.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane until interrupted
    Serve,
    /// Print the effective configuration as TOML
    Config,
    /// Check a working-directory path against the filename rules
    CheckPath {
        /// Path relative to a run's working directory
        path: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => tokio::runtime::Runtime::new()?.block_on(serve_command()),
        Commands::Config => config_command(),
        Commands::CheckPath { path } => check_path_command(&path),
    }
}

fn load_config() -> Result<RunControlConfig> {
    RunControlConfig::load_env_file()?;
    RunControlConfig::load()
}

async fn serve_command() -> Result<()> {
    let config = load_config()?;
    init_telemetry(&config.observability)?;

    let control = Arc::new(ControlPlane::from_config(config)?);
    control.start_sweeper();
    tracing::info!(
        max_runs = control.policy().max_runs(),
        operating_limit = control.policy().operating_limit(),
        "Run control plane serving"
    );

    let exit_code = ShutdownCoordinator::new(control).wait_for_shutdown().await?;
    if let Some(code) = exit_code.filter(|code| *code != 0) {
        tracing::warn!(exit_code = code, "Worker forker exited abnormally");
    }
    Ok(())
}

fn config_command() -> Result<()> {
    let config = load_config()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn check_path_command(path: &str) -> Result<()> {
    match validate_filename(path) {
        Ok(()) => {
            println!("✅ {path} is a valid working-directory path");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    }
}
