//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

use super::{parse_duration, parse_timeout_ms, AppConfig, ConfigError};

/// Environment variable prefix
const ENV_PREFIX: &str = "TAPSWARM";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Address from TAPSWARM_ADDR
    pub addr: Option<String>,
    /// Idle timeout from TAPSWARM_TIMEOUT
    pub timeout: Option<String>,
    /// Jobs from TAPSWARM_JOBS
    pub jobs: Option<String>,
    /// Command template from TAPSWARM_EXEC
    pub exec: Option<String>,
    /// Retry attempts from TAPSWARM_MAX_RETRY
    pub max_retry: Option<String>,
    /// Retry delay cap from TAPSWARM_MAX_DELAY
    pub max_delay: Option<String>,
    /// Config file from TAPSWARM_CONFIG
    pub config_file: Option<String>,
    /// Output format from TAPSWARM_FORMAT
    pub format: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            addr: get_env("ADDR"),
            timeout: get_env("TIMEOUT"),
            jobs: get_env("JOBS"),
            exec: get_env("EXEC"),
            max_retry: get_env("MAX_RETRY"),
            max_delay: get_env("MAX_DELAY"),
            config_file: get_env("CONFIG"),
            format: get_env("FORMAT"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.addr.is_some()
            || self.timeout.is_some()
            || self.jobs.is_some()
            || self.exec.is_some()
            || self.max_retry.is_some()
            || self.max_delay.is_some()
            || self.config_file.is_some()
            || self.format.is_some()
    }

    /// Overlay the variables that are set onto `config`
    pub fn apply(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Some(addr) = &self.addr {
            config.dispatcher.addr = addr.clone();
            config.agent.addr = addr.clone();
        }
        if let Some(timeout) = &self.timeout {
            config.dispatcher.timeout_ms = parse_timeout_ms(timeout)?;
        }
        if let Some(jobs) = &self.jobs {
            config.agent.jobs = parse_value("JOBS", jobs)?;
        }
        if let Some(exec) = &self.exec {
            config.agent.exec = exec.clone();
        }
        if let Some(max_retry) = &self.max_retry {
            config.retry.max_attempts = parse_value("MAX_RETRY", max_retry)?;
        }
        if let Some(max_delay) = &self.max_delay {
            config.retry.max_delay_ms = parse_duration(max_delay)?.as_millis() as u64;
        }
        if let Some(format) = &self.format {
            config.output.format = format.clone();
        }
        Ok(())
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}_{name}"),
        value: value.to_string(),
    })
}

/// Print all TAPSWARM environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_ADDR        Dispatcher address (host:port)");
    println!("  {ENV_PREFIX}_TIMEOUT     Dispatcher idle timeout (e.g. 10m)");
    println!("  {ENV_PREFIX}_JOBS        Worker lanes per agent");
    println!("  {ENV_PREFIX}_EXEC        Command template used to run each test");
    println!("  {ENV_PREFIX}_MAX_RETRY   RPC attempts before a loop gives up");
    println!("  {ENV_PREFIX}_MAX_DELAY   Cap for a single backoff delay (e.g. 3s)");
    println!("  {ENV_PREFIX}_CONFIG      Path to configuration file");
    println!("  {ENV_PREFIX}_FORMAT      Report format (table, summary, json, csv, junit)");
}
