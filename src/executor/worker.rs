//! Worker lanes
//!
//! Each lane drains the shared work queue one assignment at a time. The lane's
//! loop is wrapped by the plugin chain, and every lane owns a private copy of
//! the execution environment so plugins on one lane never leak into another.

use futures::future::FutureExt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::plugin::{Action, PluginChain};
use super::runner::TestRunner;
use crate::models::{TestAssignment, TestResult};

/// Environment variable carrying the lane index
pub const WORKER_ID_ENV: &str = "TAPSWARM_WORKER_ID";

/// Work channel receiver shared by every lane of a pool
pub type WorkQueue = Arc<Mutex<mpsc::Receiver<TestAssignment>>>;

pub fn shared_queue(rx: mpsc::Receiver<TestAssignment>) -> WorkQueue {
    Arc::new(Mutex::new(rx))
}

/// A finished test on its way back to the dispatcher
#[derive(Clone, Debug)]
pub struct TestOutcome {
    pub path: String,
    pub result: TestResult,
}

/// One execution lane
pub struct Worker {
    id: usize,
    env: Vec<(String, String)>,
    runner: TestRunner,
    queue: WorkQueue,
    results: mpsc::Sender<TestOutcome>,
}

impl Worker {
    pub fn new(
        id: usize,
        env: Vec<(String, String)>,
        runner: TestRunner,
        queue: WorkQueue,
        results: mpsc::Sender<TestOutcome>,
    ) -> Self {
        Self {
            id,
            env,
            runner,
            queue,
            results,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    #[cfg(test)]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Append an entry to this lane's environment; later entries win
    pub fn push_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.push((key.into(), value.into()));
    }

    /// Last value set for `key`
    #[cfg(test)]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Base action of every lane: drain the queue until it is closed
    pub fn drain_action() -> Action {
        Box::new(|mut worker: Worker| {
            async move {
                worker.drain().await;
                worker
            }
            .boxed()
        })
    }

    async fn drain(&mut self) {
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(mut assignment) = next else {
                break;
            };

            assignment.env = self.env.clone();
            info!("start {}", assignment.path);
            let result = self.runner.run(&assignment).await;
            info!("finish {} {}", assignment.path, result);

            let outcome = TestOutcome {
                path: assignment.path,
                result,
            };
            if self.results.send(outcome).await.is_err() {
                error!("worker {}: result channel closed, stopping", self.id);
                break;
            }
        }
        debug!("worker {} drained", self.id);
    }
}

/// Fixed-size set of lanes sharing one work queue
pub struct WorkerPool {
    lanes: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Start `jobs` lanes (at least one), each wrapped by `plugins`
    pub fn spawn(
        jobs: usize,
        plugins: &PluginChain,
        base_env: &[(String, String)],
        runner: TestRunner,
        queue: WorkQueue,
        results: mpsc::Sender<TestOutcome>,
    ) -> Self {
        let size = jobs.max(1);
        let mut lanes = JoinSet::new();

        for id in 0..size {
            let mut env = base_env.to_vec();
            env.push((WORKER_ID_ENV.to_string(), id.to_string()));

            let worker = Worker::new(id, env, runner.clone(), queue.clone(), results.clone());
            let lane = plugins.compose(Worker::drain_action());
            lanes.spawn(async move {
                let worker = lane(worker).await;
                debug!("worker {} stopped", worker.id());
            });
        }

        info!("started {} workers (plugins: {:?})", size, plugins);
        Self { lanes, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every lane to finish
    pub async fn join(mut self) {
        while let Some(joined) = self.lanes.join_next().await {
            if let Err(e) = joined {
                error!("worker lane aborted: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Plugin, PluginSpec, PluginRegistry};
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Exports a lane-specific marker, proving lanes do not share buffers
    struct LaneMarker;

    impl Plugin for LaneMarker {
        fn name(&self) -> &str {
            "lane-marker"
        }

        fn wrap(self: Arc<Self>, next: Action) -> Action {
            Box::new(move |mut worker: Worker| {
                let marker = format!("lane{}", worker.id());
                worker.push_env("LANE_MARK", marker);
                next(worker)
            })
        }
    }

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_env_var_last_wins() {
        let (_tx, rx) = mpsc::channel(1);
        let (result_tx, _result_rx) = mpsc::channel(1);
        let mut worker = Worker::new(3, Vec::new(), TestRunner::new(), shared_queue(rx), result_tx);
        worker.push_env("A", "1");
        worker.push_env("A", "2");
        assert_eq!(worker.env_var("A"), Some("2"));
        assert_eq!(worker.env().len(), 2);
        assert_eq!(worker.id(), 3);
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let ok = script("echo '1..1'\necho 'ok 1'\n");
        let bad = script("echo '1..1'\necho 'not ok 1'\n");

        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let env: Vec<(String, String)> = std::env::vars().collect();
        let pool = WorkerPool::spawn(
            2,
            &PluginChain::new(),
            &env,
            TestRunner::new(),
            shared_queue(work_rx),
            result_tx,
        );
        assert_eq!(pool.size(), 2);

        let paths = vec![
            ok.path().to_string_lossy().to_string(),
            bad.path().to_string_lossy().to_string(),
        ];
        let feed = paths.clone();
        tokio::spawn(async move {
            for path in feed {
                work_tx.send(TestAssignment::new(path, "sh")).await.unwrap();
            }
        });

        let mut outcomes = Vec::new();
        while outcomes.len() < 2 {
            outcomes.push(result_rx.recv().await.unwrap());
        }
        pool.join().await;
        assert!(result_rx.recv().await.is_none());

        outcomes.sort_by(|a, b| a.path.cmp(&b.path));
        let mut expected = paths;
        expected.sort();
        assert_eq!(outcomes.iter().map(|o| o.path.clone()).collect::<Vec<_>>(), expected);
        assert_eq!(outcomes.iter().filter(|o| o.result.ok).count(), 1);
    }

    #[tokio::test]
    async fn test_lane_environments_are_isolated() {
        // each test reports the marker it saw on its own lane
        let probe = script("echo '1..1'\necho \"ok 1 - $TAPSWARM_WORKER_ID $LANE_MARK\"\n");
        let path = probe.path().to_string_lossy().to_string();

        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let env: Vec<(String, String)> = std::env::vars().collect();
        let chain = PluginChain::new().with(Arc::new(LaneMarker));
        let pool = WorkerPool::spawn(3, &chain, &env, TestRunner::new(), shared_queue(work_rx), result_tx);

        tokio::spawn(async move {
            for _ in 0..6 {
                work_tx.send(TestAssignment::new(path.clone(), "sh")).await.unwrap();
            }
        });

        let mut seen = Vec::new();
        while let Some(outcome) = result_rx.recv().await {
            seen.push(outcome.result.tests[0].description.clone());
            if seen.len() == 6 {
                break;
            }
        }
        pool.join().await;

        for description in seen {
            let (id, marker) = description.split_once(' ').unwrap();
            assert_eq!(marker, format!("lane{id}"));
        }
    }

    #[tokio::test]
    async fn test_pool_with_registry_plugins() {
        let probe = script("echo '1..1'\nif [ \"$FROM_PLUGIN\" = 1 ]; then echo 'ok 1'; else echo 'not ok 1'; fi\n");
        let registry = PluginRegistry::with_builtins();
        let specs: Vec<PluginSpec> = vec!["env=FROM_PLUGIN=1".parse().unwrap()];
        let chain = registry.load_chain(&specs).unwrap();

        let (work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let env: Vec<(String, String)> = std::env::vars().collect();
        let pool = WorkerPool::spawn(1, &chain, &env, TestRunner::new(), shared_queue(work_rx), result_tx);

        work_tx
            .send(TestAssignment::new(probe.path().to_string_lossy(), "sh"))
            .await
            .unwrap();
        drop(work_tx);

        let outcome = result_rx.recv().await.unwrap();
        pool.join().await;
        assert!(outcome.result.ok);
    }
}
