//! Combined mode
//!
//! One dispatcher and one agent in the same process, talking the regular RPC
//! protocol over a loopback port picked by the OS.

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::{Agent, AgentError};
use crate::config::AppConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::executor::PluginRegistry;
use crate::output::Formatter;

const LOOPBACK: &str = "127.0.0.1:0";

#[derive(Error, Debug)]
pub enum SoloError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

pub struct Solo {
    config: AppConfig,
}

impl Solo {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, registry: &PluginRegistry, formatter: &mut dyn Formatter) -> Result<i32, SoloError> {
        let listener = TcpListener::bind(LOOPBACK)
            .await
            .map_err(|source| DispatchError::Bind {
                addr: LOOPBACK.to_string(),
                source,
            })?;
        let addr = listener
            .local_addr()
            .map_err(|source| DispatchError::Bind {
                addr: LOOPBACK.to_string(),
                source,
            })?
            .to_string();

        let mut dispatcher_config = self.config.dispatcher.clone();
        dispatcher_config.addr = addr.clone();
        dispatcher_config.accept_submitted = false;
        let mut agent_config = self.config.agent.clone();
        agent_config.addr = addr;
        agent_config.submit = None;

        // both sides validate before any traffic
        let dispatcher = Dispatcher::new(dispatcher_config).with_listener(listener);
        let state = dispatcher.prepare()?;
        let agent = Agent::new(agent_config, self.config.retry.clone(), registry)?;

        let cancel = CancellationToken::new();
        let agent_task = tokio::spawn(agent.run(cancel.clone()));

        let outcome = dispatcher.serve(state, formatter).await;
        cancel.cancel();

        match &outcome {
            Ok(_) => match agent_task.await {
                Ok(summary) => debug!("local agent: {:?}", summary),
                Err(e) => error!("local agent failed: {}", e),
            },
            Err(_) => {
                info!("stopping local agent");
                agent_task.abort();
            }
        }

        Ok(outcome?)
    }
}
