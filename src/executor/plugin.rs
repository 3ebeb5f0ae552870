//! Worker plugins
//!
//! A plugin wraps a worker lane's whole loop, not individual tests. Plugins are
//! composed by folding `wrap(next) -> Action` over the registered list, so the
//! first registered plugin is the outermost layer and the last one runs closest
//! to the base loop.

use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::worker::Worker;
use crate::utils::shell;

/// One step of a worker lane. Takes the worker and hands it back when done.
pub type Action = Box<dyn FnOnce(Worker) -> BoxFuture<'static, Worker> + Send>;

/// Builds a plugin from its inline argument string
pub type PluginLoader = Box<dyn Fn(&str, &str) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {0} not found")]
    NotFound(String),

    #[error("plugin {name}: {reason}")]
    InvalidArgs { name: String, reason: String },

    #[error("empty plugin specification")]
    EmptySpec,
}

/// Middleware around a worker lane.
///
/// Implementations may edit the worker's environment before calling `next`
/// and clean up after it returns. `next` must eventually be awaited or the
/// lane never runs a test.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(self: Arc<Self>, next: Action) -> Action;
}

/// `name` or `name=args`, as given on the command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub args: String,
}

impl FromStr for PluginSpec {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, args) = s.split_once('=').unwrap_or((s, ""));
        let name = name.trim();
        if name.is_empty() {
            return Err(PluginError::EmptySpec);
        }
        Ok(Self {
            name: name.to_string(),
            args: args.to_string(),
        })
    }
}

impl fmt::Display for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}={}", self.name, self.args)
        }
    }
}

/// Ordered list of plugins applied to every lane
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.push(plugin);
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Wrap `base` so that `plugins[0]` is outermost
    pub fn compose(&self, base: Action) -> Action {
        self.plugins
            .iter()
            .rev()
            .fold(base, |next, plugin| Arc::clone(plugin).wrap(next))
    }
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Name to loader lookup, filled by explicit `register` calls at startup
pub struct PluginRegistry {
    loaders: BTreeMap<String, PluginLoader>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Registry with no loaders
    pub fn new() -> Self {
        Self {
            loaders: BTreeMap::new(),
        }
    }

    /// Registry holding the plugins that ship with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("env", |name, args| {
            Ok(Arc::new(EnvPlugin::parse(name, args)?) as Arc<dyn Plugin>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn(&str, &str) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.loaders.insert(name.into(), Box::new(loader));
    }

    pub fn names(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }

    pub fn load(&self, name: &str, args: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        debug!("loading plugin {} with args {:?}", name, args);
        loader(name, args)
    }

    /// Resolve every spec, in order, into a chain
    pub fn load_chain(&self, specs: &[PluginSpec]) -> Result<PluginChain, PluginError> {
        specs.iter().try_fold(PluginChain::new(), |chain, spec| {
            Ok(chain.with(self.load(&spec.name, &spec.args)?))
        })
    }
}

/// Appends fixed `KEY=VALUE` entries to the lane environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvPlugin {
    name: String,
    vars: Vec<(String, String)>,
}

impl EnvPlugin {
    pub fn parse(name: &str, args: &str) -> Result<Self, PluginError> {
        let invalid = |reason: String| PluginError::InvalidArgs {
            name: name.to_string(),
            reason,
        };

        let words = shell::split(args).map_err(|e| invalid(e.to_string()))?;
        let vars = words
            .into_iter()
            .map(|word| match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(invalid(format!("expected KEY=VALUE, got '{word}'"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            vars,
        })
    }
}

impl Plugin for EnvPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(self: Arc<Self>, next: Action) -> Action {
        Box::new(move |mut worker: Worker| {
            async move {
                for (key, value) in &self.vars {
                    info!("worker {}: export {}", worker.id(), key);
                    worker.push_env(key.clone(), value.clone());
                }
                next(worker).await
            }
            .boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{shared_queue, TestRunner};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records setup/teardown around the lane loop
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn wrap(self: Arc<Self>, next: Action) -> Action {
            Box::new(move |worker: Worker| {
                async move {
                    self.log.lock().unwrap().push(format!("setup {}", self.label));
                    let worker = next(worker).await;
                    self.log.lock().unwrap().push(format!("teardown {}", self.label));
                    worker
                }
                .boxed()
            })
        }
    }

    fn idle_worker() -> Worker {
        let (_work_tx, work_rx) = mpsc::channel(1);
        let (result_tx, _result_rx) = mpsc::channel(1);
        Worker::new(0, Vec::new(), TestRunner::new(), shared_queue(work_rx), result_tx)
    }

    #[test]
    fn test_plugin_spec_parse() {
        let spec: PluginSpec = "harness=--port 9000 x=y".parse().unwrap();
        assert_eq!(spec.name, "harness");
        assert_eq!(spec.args, "--port 9000 x=y");

        let bare: PluginSpec = "mysqld".parse().unwrap();
        assert_eq!(bare.args, "");
        assert_eq!(bare.to_string(), "mysqld");

        assert_eq!("=x".parse::<PluginSpec>(), Err(PluginError::EmptySpec));
    }

    #[tokio::test]
    async fn test_chain_stack_discipline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new()
            .with(Arc::new(Recorder { label: "A", log: log.clone() }))
            .with(Arc::new(Recorder { label: "B", log: log.clone() }));

        let inner_log = log.clone();
        let base: Action = Box::new(move |worker: Worker| {
            async move {
                inner_log.lock().unwrap().push("base".to_string());
                worker
            }
            .boxed()
        });

        chain.compose(base)(idle_worker()).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["setup A", "setup B", "base", "teardown B", "teardown A"]
        );
    }

    #[tokio::test]
    async fn test_env_plugin_appends_to_worker() {
        let chain = PluginChain::new().with(Arc::new(EnvPlugin::parse("env", "DB=test X='a b'").unwrap()));
        let base: Action = Box::new(|worker: Worker| async move { worker }.boxed());

        let worker = chain.compose(base)(idle_worker()).await;
        assert_eq!(worker.env_var("DB"), Some("test"));
        assert_eq!(worker.env_var("X"), Some("a b"));
    }

    #[test]
    fn test_env_plugin_rejects_bad_args() {
        assert!(matches!(
            EnvPlugin::parse("env", "NOVALUE"),
            Err(PluginError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["env"]);
        assert!(matches!(
            registry.load("nope", ""),
            Err(PluginError::NotFound(name)) if name == "nope"
        ));

        let specs = vec!["env=A=1".parse().unwrap(), "env=B=2".parse().unwrap()];
        let chain = registry.load_chain(&specs).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_registry_explicit_register() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", |name, _args| {
            Ok(Arc::new(EnvPlugin::parse(name, "")?) as Arc<dyn Plugin>)
        });
        assert!(registry.load("noop", "").is_ok());
    }
}
