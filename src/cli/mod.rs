//! CLI argument parsing
//!
//! Defines command-line interface using clap. Every value flag is optional so
//! that anything left unset falls through to the environment, the config file
//! and finally the built-in defaults.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{parse_duration, parse_timeout_ms, AppConfig, ConfigError};

/// Distributed runner for line-protocol (TAP) test files
#[derive(Parser, Debug)]
#[command(name = "tapswarm")]
#[command(version)]
#[command(about = "Run TAP test files in parallel across one or more agents")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve test files to agents and report the results
    Dispatch(DispatchArgs),

    /// Pull test files from a dispatcher and run them
    Agent(AgentArgs),

    /// Run a dispatcher and an agent in this process
    Solo(SoloArgs),

    /// List registered plugins
    Plugins,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the config command
#[derive(ClapArgs, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a configuration file holding the defaults
    Init {
        /// Destination [default: ~/.config/tapswarm/config.yaml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// List supported environment variables
    Env,
}

/// Arguments for the dispatch command
#[derive(ClapArgs, Debug)]
pub struct DispatchArgs {
    /// Listen address (host:port)
    #[arg(long)]
    pub addr: Option<String>,

    /// Take the file list from the first agent that submits one
    #[arg(long)]
    pub accept_submitted: bool,

    #[command(flatten)]
    pub files: FileArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

/// Arguments for the agent command
#[derive(ClapArgs, Debug)]
pub struct AgentArgs {
    /// Dispatcher address (host:port)
    #[arg(long)]
    pub addr: Option<String>,

    /// Discover these paths locally and submit the list on the first pull
    #[arg(long, value_name = "PATH")]
    pub submit: Vec<String>,

    /// Suffix of test files found under submitted directories
    #[arg(long)]
    pub suffix: Option<String>,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Arguments for the solo command
#[derive(ClapArgs, Debug)]
pub struct SoloArgs {
    #[command(flatten)]
    pub files: FileArgs,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(flatten)]
    pub report: ReportArgs,
}

/// Which files to run and how long to wait for agents
#[derive(ClapArgs, Debug)]
pub struct FileArgs {
    /// Test files or directories [default: t]
    pub paths: Vec<String>,

    /// Suffix of test files found under directories
    #[arg(long)]
    pub suffix: Option<String>,

    /// Abort if no agent asks for work within this long (e.g. 10m)
    #[arg(long)]
    pub timeout: Option<String>,
}

/// How an agent executes its tests
#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Number of parallel workers
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Plugin as NAME or NAME=ARGS; repeat to stack, outermost first
    #[arg(short = 'P', long = "plugin", value_name = "SPEC")]
    pub plugins: Vec<String>,

    /// Command used to run each test; the path is appended
    #[arg(long)]
    pub exec: Option<String>,

    /// Merge test stderr into the parsed output
    #[arg(long)]
    pub merge: bool,

    /// Discard test stderr
    #[arg(short, long)]
    pub quiet: bool,

    /// RPC attempts before a loop gives up
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Longest single backoff delay (e.g. 3s)
    #[arg(long)]
    pub max_delay: Option<String>,
}

/// Report rendering
#[derive(ClapArgs, Debug)]
pub struct ReportArgs {
    /// Output format (table, json, json-pretty, csv, junit, summary)
    #[arg(short, long)]
    pub format: Option<String>,

    /// Write the report to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl DispatchArgs {
    pub fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Some(addr) = &self.addr {
            config.dispatcher.addr = addr.clone();
        }
        if self.accept_submitted {
            config.dispatcher.accept_submitted = true;
        }
        self.files.apply(config)?;
        self.report.apply(config);
        Ok(())
    }
}

impl AgentArgs {
    pub fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Some(addr) = &self.addr {
            config.agent.addr = addr.clone();
        }
        if !self.submit.is_empty() {
            config.agent.submit = Some(self.submit.clone());
        }
        if let Some(suffix) = &self.suffix {
            config.agent.suffix = suffix.clone();
        }
        self.run.apply(config)
    }
}

impl SoloArgs {
    pub fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        self.files.apply(config)?;
        self.run.apply(config)?;
        self.report.apply(config);
        Ok(())
    }
}

impl FileArgs {
    fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if !self.paths.is_empty() {
            config.dispatcher.paths = self.paths.clone();
        }
        if let Some(suffix) = &self.suffix {
            config.dispatcher.suffix = suffix.clone();
        }
        if let Some(timeout) = &self.timeout {
            config.dispatcher.timeout_ms = parse_timeout_ms(timeout)?;
        }
        Ok(())
    }
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Some(jobs) = self.jobs {
            config.agent.jobs = jobs;
        }
        if !self.plugins.is_empty() {
            config.agent.plugins = self.plugins.clone();
        }
        if let Some(exec) = &self.exec {
            config.agent.exec = exec.clone();
        }
        if self.merge {
            config.agent.merge = true;
        }
        if self.quiet {
            config.agent.quiet = true;
        }
        if let Some(max_retry) = self.max_retry {
            config.retry.max_attempts = max_retry;
        }
        if let Some(max_delay) = &self.max_delay {
            config.retry.max_delay_ms = parse_duration(max_delay)?.as_millis() as u64;
        }
        Ok(())
    }
}

impl ReportArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(format) = &self.format {
            config.output.format = format.clone();
        }
        if let Some(output) = &self.output {
            config.output.file = Some(output.to_string_lossy().into_owned());
        }
        if self.no_color {
            config.output.color = false;
        }
    }
}
