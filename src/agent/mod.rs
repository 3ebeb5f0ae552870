//! Agent (slave)
//!
//! Pulls paths from the dispatcher, feeds them to a worker pool and pushes
//! the results back. Pull and push each run under the shared retry policy;
//! exhausting it stops only the loop that failed.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::dispatcher::discover;
use crate::executor::{
    shared_queue, PluginChain, PluginRegistry, PluginSpec, TestOutcome, TestRunner, WorkerPool,
};
use crate::models::{StderrMode, TestAssignment};
use crate::rpc::{GetTestRequest, ResultRequest, RpcClient, RpcError};
use crate::utils::{shell, RetryPolicy};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// What one agent run did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentSummary {
    /// Assignments handed to the worker pool
    pub pulled: usize,
    /// Results acknowledged by the dispatcher
    pub pushed: usize,
    /// Results never delivered
    pub dropped: usize,
}

pub struct Agent {
    config: AgentConfig,
    retry: RetryPolicy,
    plugins: PluginChain,
    client: RpcClient,
    submit: Option<Vec<String>>,
    env: Vec<(String, String)>,
}

impl Agent {
    /// Resolve plugins and, when submitting, the local file list.
    ///
    /// Unknown plugins and missing paths are startup errors.
    pub fn new(config: AgentConfig, retry: RetryPolicy, registry: &PluginRegistry) -> Result<Self, AgentError> {
        let specs = config
            .plugins
            .iter()
            .map(|spec| spec.parse::<PluginSpec>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::from)?;
        let plugins = registry.load_chain(&specs).map_err(ConfigError::from)?;
        shell::split(&config.exec).map_err(ConfigError::from)?;

        let submit = match &config.submit {
            Some(paths) => {
                let files = discover(paths, &config.suffix)?;
                info!("submitting {} locally discovered test files", files.len());
                Some(files)
            }
            None => None,
        };

        let client = RpcClient::new(&config.addr, &retry)?;

        Ok(Self {
            config,
            retry,
            plugins,
            client,
            submit,
            env: std::env::vars().collect(),
        })
    }

    pub fn plugins(&self) -> &PluginChain {
        &self.plugins
    }

    /// Work until the dispatcher runs dry, a loop gives up, or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> AgentSummary {
        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = mpsc::channel(1);

        let pool = WorkerPool::spawn(
            self.config.jobs,
            &self.plugins,
            &self.env,
            TestRunner::new(),
            shared_queue(work_rx),
            result_tx,
        );
        info!("agent for {} with {} workers", self.client.base_url(), pool.size());
        if !self.plugins().is_empty() {
            info!("{} plugins, outermost first: {:?}", self.plugins().len(), self.plugins().names());
        }

        let stop = cancel.child_token();
        let pusher = tokio::spawn(push_loop(
            self.client.clone(),
            self.retry.clone(),
            result_rx,
            stop.clone(),
        ));

        let submit = self.submit.take();
        let pulled = self.pull_loop(work_tx, submit, &stop).await;

        pool.join().await;
        let (pushed, dropped) = match pusher.await {
            Ok(counts) => counts,
            Err(e) => {
                error!("push loop task failed: {}", e);
                (0, pulled)
            }
        };

        let summary = AgentSummary {
            pulled,
            pushed,
            dropped,
        };
        info!("agent finished: {:?}", summary);
        summary
    }

    async fn pull_loop(
        &self,
        work: mpsc::Sender<TestAssignment>,
        mut submit: Option<Vec<String>>,
        stop: &CancellationToken,
    ) -> usize {
        let stderr = StderrMode::from_flags(self.config.merge, self.config.quiet);
        let mut pulled = 0;

        loop {
            let req = match submit.take() {
                Some(files) => GetTestRequest::submit(files),
                None => GetTestRequest::pull(),
            };

            let res = tokio::select! {
                _ = stop.cancelled() => break,
                res = self.retry.retry("get test", || self.client.get_test(&req)) => res,
            };
            let path = match res {
                Ok(res) if res.is_exhausted() => {
                    debug!("dispatcher has no more tests");
                    break;
                }
                Ok(res) => res.path,
                Err(e) => {
                    error!("pull loop aborted: {}", e);
                    break;
                }
            };

            let assignment = TestAssignment::new(path, self.config.exec.clone()).with_stderr(stderr);
            tokio::select! {
                _ = stop.cancelled() => break,
                sent = work.send(assignment) => {
                    if sent.is_err() {
                        break;
                    }
                    pulled += 1;
                }
            }
        }

        // dropping `work` closes the channel so the lanes drain and stop
        pulled
    }
}

/// Deliver results until the pool closes the channel.
///
/// After a delivery gives up, `stop` is cancelled and the remaining results
/// are drained and dropped so the workers never block.
async fn push_loop(
    client: RpcClient,
    retry: RetryPolicy,
    mut results: mpsc::Receiver<TestOutcome>,
    stop: CancellationToken,
) -> (usize, usize) {
    let mut pushed = 0;
    let mut dropped = 0;
    let mut aborted = false;

    while let Some(outcome) = results.recv().await {
        if aborted {
            warn!("dropping result for {}", outcome.path);
            dropped += 1;
            continue;
        }

        let json = match serde_json::to_string(&outcome.result) {
            Ok(json) => json,
            Err(e) => {
                error!("{}: cannot serialize result: {}", outcome.path, e);
                dropped += 1;
                continue;
            }
        };
        let req = ResultRequest {
            path: outcome.path,
            json,
        };

        match retry.retry("push result", || client.result(&req)).await {
            Ok(_) => pushed += 1,
            Err(e) => {
                error!("push loop aborted, remaining results will be dropped: {}", e);
                dropped += 1;
                aborted = true;
                stop.cancel();
            }
        }
    }

    (pushed, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchState;
    use crate::executor::PluginError;
    use crate::rpc::{self, GET_TEST_ROUTE, RESULT_ROUTE};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(20)).base_delay(Duration::from_millis(5))
    }

    fn sh_config(addr: String, jobs: usize) -> AgentConfig {
        AgentConfig {
            addr,
            jobs,
            exec: "sh".to_string(),
            quiet: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_agent_runs_every_dispatched_file() {
        let ok = script("echo '1..1'\necho 'ok 1'\n");
        let bad = script("echo '1..1'\necho 'not ok 1'\n");
        let files = vec![
            ok.path().to_string_lossy().into_owned(),
            bad.path().to_string_lossy().into_owned(),
        ];

        let state = Arc::new(DispatchState::new(files));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(rpc::serve(listener, state.clone(), shutdown.clone()));

        let agent = Agent::new(sh_config(addr, 2), fast_retry(3), &PluginRegistry::with_builtins()).unwrap();
        let summary = agent.run(CancellationToken::new()).await;

        assert_eq!(summary, AgentSummary { pulled: 2, pushed: 2, dropped: 0 });
        assert!(state.done().is_cancelled());
        assert_eq!(state.exit_code().await, 1);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_a_startup_error() {
        let mut config = sh_config("127.0.0.1:1".to_string(), 1);
        config.plugins = vec!["mysqld=--port 3306".to_string()];

        let err = Agent::new(config, fast_retry(1), &PluginRegistry::with_builtins()).err().unwrap();
        assert!(matches!(
            err,
            AgentError::Config(ConfigError::Plugin(PluginError::NotFound(name))) if name == "mysqld"
        ));
    }

    #[tokio::test]
    async fn test_plugins_resolved_in_order() {
        let mut config = sh_config("127.0.0.1:1".to_string(), 1);
        config.plugins = vec!["env=A=1".to_string(), "env=B=2".to_string()];
        let agent = Agent::new(config, fast_retry(1), &PluginRegistry::with_builtins()).unwrap();
        assert_eq!(agent.plugins().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher_stops_pull_loop_only() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let agent = Agent::new(sh_config(addr, 2), fast_retry(3), &PluginRegistry::with_builtins()).unwrap();
        let summary = agent.run(CancellationToken::new()).await;
        assert_eq!(summary, AgentSummary::default());
    }

    #[tokio::test]
    async fn test_failed_push_drops_results_without_deadlock() {
        let probe = script("echo '1..1'\necho 'ok 1'\n");
        let path = probe.path().to_string_lossy().into_owned();
        let queue = Arc::new(Mutex::new(vec![path.clone(), path.clone(), path]));

        let app = Router::new()
            .route(
                GET_TEST_ROUTE,
                post(move || {
                    let queue = queue.clone();
                    async move {
                        let path = queue.lock().unwrap().pop().unwrap_or_default();
                        Json(serde_json::json!({ "path": path }))
                    }
                }),
            )
            .route(RESULT_ROUTE, post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let agent = Agent::new(sh_config(addr, 1), fast_retry(2), &PluginRegistry::with_builtins()).unwrap();
        let summary = agent.run(CancellationToken::new()).await;

        assert!(summary.pulled >= 1);
        assert_eq!(summary.pushed, 0);
        assert_eq!(summary.dropped, summary.pulled);
        server.abort();
    }

    #[tokio::test]
    async fn test_submitted_file_list_seeds_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01.t"), "echo '1..1'\necho 'ok 1'\n").unwrap();

        let state = Arc::new(DispatchState::accepting_submitted());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(rpc::serve(listener, state.clone(), shutdown.clone()));

        let mut config = sh_config(addr, 1);
        config.submit = Some(vec![dir.path().to_string_lossy().into_owned()]);
        let agent = Agent::new(config, fast_retry(3), &PluginRegistry::with_builtins()).unwrap();
        let summary = agent.run(CancellationToken::new()).await;

        assert_eq!(summary.pushed, 1);
        assert!(state.done().is_cancelled());
        assert_eq!(state.exit_code().await, 0);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
