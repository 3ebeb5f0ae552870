//! tapswarm - distributed runner for TAP test files
//!
//! A dispatcher hands test files to any number of agents over a small RPC
//! protocol. Each agent runs them on a pool of workers, optionally wrapped by
//! plugins, and pushes the parsed results back. The dispatcher prints the
//! report and exits 0 only when every file passed.
//!
//! ## Usage
//!
//! ```bash
//! # Everything in one process, four workers
//! tapswarm solo -j 4 t/
//!
//! # Dispatcher on one host
//! tapswarm dispatch --addr 0.0.0.0:19300 t/
//!
//! # Agents anywhere else
//! tapswarm agent --addr dispatcher:19300 -j 8 -P env=DB_HOST=localhost
//! ```
//!
//! Exit codes: 0 all files passed, 1 some file failed, 2 fatal error.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod agent;
mod cli;
mod config;
mod dispatcher;
mod executor;
mod models;
mod output;
mod rpc;
mod solo;
mod tap;
mod utils;

use agent::Agent;
use cli::{Args, Command, ConfigAction};
use config::env::{print_env_help, EnvConfig};
use config::{default_config_path, AppConfig, OutputConfig};
use dispatcher::Dispatcher;
use executor::PluginRegistry;
use output::{OutputFormat, ResultFormatter};
use solo::Solo;
use utils::logger::{init_logger, LogLevel};

/// Exit code for startup and liveness failures
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        match args.log_level.as_deref().map(str::parse::<LogLevel>) {
            Some(Ok(level)) => level,
            Some(Err(e)) => {
                eprintln!("Error: {e}");
                std::process::exit(EXIT_FATAL);
            }
            None => LogLevel::Info,
        }
    };
    init_logger(level);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let env = EnvConfig::load();
    let mut config = load_config(args.config.clone(), &env)?;
    if env.has_any() {
        debug!("applying TAPSWARM_* environment overrides");
    }
    env.apply(&mut config)?;

    // loaders for site-specific plugins are registered here
    let registry = PluginRegistry::with_builtins();

    match args.command {
        Command::Dispatch(dispatch_args) => {
            dispatch_args.apply(&mut config)?;
            let mut formatter = build_formatter(&config.output)?;
            let code = Dispatcher::new(config.dispatcher).run(&mut formatter).await?;
            Ok(code)
        }
        Command::Agent(agent_args) => {
            agent_args.apply(&mut config)?;
            let agent = Agent::new(config.agent, config.retry, &registry)?;
            let cancel = CancellationToken::new();
            let summary = agent.run(cancel).await;
            info!(
                "pulled {}, pushed {}, dropped {}",
                summary.pulled, summary.pushed, summary.dropped
            );
            Ok(0)
        }
        Command::Solo(solo_args) => {
            solo_args.apply(&mut config)?;
            let mut formatter = build_formatter(&config.output)?;
            let code = Solo::new(config).run(&registry, &mut formatter).await?;
            Ok(code)
        }
        Command::Plugins => {
            println!("Registered plugins:");
            for name in registry.names() {
                println!("  {name}");
            }
            Ok(0)
        }
        Command::Config(config_args) => {
            manage_config(config_args.action, &config)?;
            Ok(0)
        }
    }
}

/// File named on the command line, else `TAPSWARM_CONFIG`, else the default location
fn load_config(path: Option<PathBuf>, env: &EnvConfig) -> Result<AppConfig> {
    let path = path.or_else(|| env.config_file.as_ref().map(PathBuf::from));
    if let Some(path) = &path {
        debug!("loading config from {}", path.display());
    }
    Ok(AppConfig::load_or_default(path.as_deref())?)
}

fn build_formatter(output: &OutputConfig) -> Result<ResultFormatter> {
    let format: OutputFormat = output.format.parse().map_err(anyhow::Error::msg)?;

    let mut formatter = ResultFormatter::new(format);
    if !output.color {
        formatter = formatter.no_color();
    }
    if let Some(file) = &output.file {
        formatter = formatter.to_file(file);
    }
    Ok(formatter)
}

fn manage_config(action: ConfigAction, config: &AppConfig) -> Result<()> {
    match action {
        ConfigAction::Init { output, force } => {
            let path = output
                .or_else(default_config_path)
                .context("cannot determine a configuration directory, pass --output")?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    path.display()
                );
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }

            AppConfig::default().save(&path)?;
            println!("✓ Configuration file created: {}", path.display());
        }

        ConfigAction::Show { format } => {
            let output = if format == "json" {
                serde_json::to_string_pretty(config)?
            } else {
                serde_yaml::to_string(config)?
            };
            println!("{output}");
        }

        ConfigAction::Env => print_env_help(),
    }

    Ok(())
}
