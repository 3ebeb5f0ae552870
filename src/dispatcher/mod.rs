//! Dispatcher (master)
//!
//! Owns the canonical file list, hands out one path per `GetTest` call,
//! records results as they come back and ends the run when nothing is
//! pending. An idle timer, reset on every `GetTest`, is the only liveness
//! check: if it fires first the run is aborted.

mod completion;
mod discovery;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use completion::{CompletionMap, Recorded};
pub use discovery::discover;

use crate::config::{ConfigError, DispatcherConfig};
use crate::models::TestResult;
use crate::output::Formatter;
use crate::rpc::{self, GetTestRequest, GetTestResponse, ResultRequest, ResultResponse, TestService};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent lost: no test requested for {timeout:?}, {pending} of {total} files pending")]
    AgentLost {
        timeout: Duration,
        pending: usize,
        total: usize,
    },

    #[error("failed to write report: {0}")]
    Report(#[source] std::io::Error),
}

/// Shared state behind the RPC handlers
#[derive(Debug)]
pub struct DispatchState {
    queue: Mutex<VecDeque<String>>,
    completion: Mutex<CompletionMap>,
    activity: Notify,
    seeded: CancellationToken,
    done: CancellationToken,
    accept_submitted: bool,
}

impl DispatchState {
    /// State serving `files`, in order
    pub fn new(files: Vec<String>) -> Self {
        Self::with_map(CompletionMap::new(files), false)
    }

    /// State waiting for the first agent to submit its file list
    pub fn accepting_submitted() -> Self {
        Self::with_map(CompletionMap::unseeded(), true)
    }

    fn with_map(completion: CompletionMap, accept_submitted: bool) -> Self {
        let queue = completion.paths().iter().cloned().collect();
        let seeded = CancellationToken::new();
        if !accept_submitted {
            seeded.cancel();
        }
        let done = CancellationToken::new();
        if completion.is_complete() {
            done.cancel();
        }
        Self {
            queue: Mutex::new(queue),
            completion: Mutex::new(completion),
            activity: Notify::new(),
            seeded,
            done,
            accept_submitted,
        }
    }

    /// Fires once every file has a result or the run is aborted
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    #[cfg(test)]
    pub async fn exit_code(&self) -> i32 {
        self.completion.lock().await.exit_code()
    }

    /// Hand every file, with its result or pending state, to `formatter`
    pub async fn report(&self, formatter: &mut dyn Formatter) -> std::io::Result<i32> {
        let entries = self.completion.lock().await.entries();
        for entry in entries {
            formatter.open_test(entry);
        }
        formatter.report()
    }

    async fn accept(&self, files: Vec<String>) {
        if !self.accept_submitted {
            debug!("ignoring {} submitted files", files.len());
            return;
        }

        let mut completion = self.completion.lock().await;
        if !completion.seed(files) {
            debug!("file list already submitted, ignoring");
            return;
        }
        info!("accepted {} submitted test files", completion.len());
        self.queue.lock().await.extend(completion.paths().iter().cloned());
        self.seeded.cancel();
        if completion.is_complete() {
            self.done.cancel();
        }
    }

    /// Block until the run completes or no agent asks for work within `timeout`
    async fn watch(&self, timeout: Duration) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return Ok(()),
                _ = self.activity.notified() => continue,
                _ = tokio::time::sleep(timeout) => {
                    // release pulls still waiting for a file list
                    self.done.cancel();
                    let completion = self.completion.lock().await;
                    return Err(DispatchError::AgentLost {
                        timeout,
                        pending: completion.pending(),
                        total: completion.len(),
                    });
                }
            }
        }
    }
}

impl TestService for DispatchState {
    async fn get_test(&self, req: GetTestRequest) -> GetTestResponse {
        self.activity.notify_one();
        if req.submitted {
            self.accept(req.test_files).await;
        }

        // an empty queue only means "no more work" once a file list exists
        if !self.seeded.is_cancelled() {
            debug!("waiting for an agent to submit the file list");
            tokio::select! {
                _ = self.seeded.cancelled() => {}
                _ = self.done.cancelled() => return GetTestResponse::exhausted(),
            }
        }

        match self.queue.lock().await.pop_front() {
            Some(path) => {
                info!("send: {}", path);
                GetTestResponse { path }
            }
            None => GetTestResponse::exhausted(),
        }
    }

    async fn result(&self, req: ResultRequest) -> ResultResponse {
        let result = serde_json::from_str::<TestResult>(&req.json).unwrap_or_else(|e| {
            warn!("{}: malformed result: {}", req.path, e);
            TestResult::error(format!("malformed result: {e}"))
        });
        info!("receive: {} {}", req.path, result);

        let mut completion = self.completion.lock().await;
        match completion.record(&req.path, result) {
            Recorded::Accepted => {}
            Recorded::Duplicate => warn!("{}: duplicate result ignored", req.path),
            Recorded::Unknown => warn!("{}: result for unknown file ignored", req.path),
        }
        if completion.is_complete() {
            self.done.cancel();
        }
        ResultResponse {}
    }
}

/// One dispatcher run: discover, serve, wait, report
pub struct Dispatcher {
    config: DispatcherConfig,
    listener: Option<TcpListener>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config, listener: None }
    }

    /// Serve on an already bound socket instead of `config.addr`
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the shared state, discovering files unless agents submit them
    pub fn prepare(&self) -> Result<DispatchState, DispatchError> {
        self.config.timeout()?;
        if self.config.accept_submitted {
            info!("waiting for an agent to submit the file list");
            return Ok(DispatchState::accepting_submitted());
        }

        let files = discover(&self.config.search_paths(), &self.config.suffix)?;
        info!("discovered {} test files", files.len());
        Ok(DispatchState::new(files))
    }

    /// Run to completion and report through `formatter`.
    ///
    /// Returns the formatter's exit code. When the idle timer fires, the
    /// results collected so far are still reported before the
    /// [`DispatchError::AgentLost`] is returned.
    pub async fn run(self, formatter: &mut dyn Formatter) -> Result<i32, DispatchError> {
        let state = self.prepare()?;
        self.serve(state, formatter).await
    }

    /// Serve an already prepared `state`; see [`Dispatcher::run`]
    pub async fn serve(self, state: DispatchState, formatter: &mut dyn Formatter) -> Result<i32, DispatchError> {
        let idle_timeout = self.config.timeout()?;
        let state = Arc::new(state);

        let listener = match self.listener {
            Some(listener) => listener,
            None => TcpListener::bind(&self.config.addr)
                .await
                .map_err(|source| DispatchError::Bind {
                    addr: self.config.addr.clone(),
                    source,
                })?,
        };

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(rpc::serve(listener, state.clone(), shutdown.clone()));

        let outcome = state.watch(idle_timeout).await;

        // graceful shutdown lets in-flight responses drain
        shutdown.cancel();
        match server.await {
            Ok(Ok(())) => debug!("rpc server stopped"),
            Ok(Err(e)) => error!("rpc server failed: {}", e),
            Err(e) => error!("rpc server task aborted: {}", e),
        }

        let code = state.report(formatter).await.map_err(DispatchError::Report)?;
        outcome?;

        info!("run finished with exit code {}", code);
        Ok(code)
    }
}
