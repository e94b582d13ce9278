use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{executors, Action, ActionType};
use crate::core::{DeployError, EngineConfig, Result};
use crate::machine::MachineConnector;

/// Everything an executor may touch besides its action
#[derive(Clone)]
pub struct ExecContext {
    pub connector: Arc<dyn MachineConnector>,
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(connector: Arc<dyn MachineConnector>, config: Arc<EngineConfig>) -> Self {
        Self {
            connector,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            connector: self.connector.clone(),
            config: self.config.clone(),
            cancel,
        }
    }
}

/// Performs the remote work of one action type.
///
/// Implementations must not share mutable state between different actions;
/// the same executor is invoked concurrently for every action of its type.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()>;
}

/// Action type -> executor. Each type may be registered once.
pub struct ExecutorRegistry {
    executors: DashMap<ActionType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// A registry with every built-in executor
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new();
        executors::register_builtin(&registry)?;
        Ok(registry)
    }

    pub fn register(&self, action_type: ActionType, executor: Arc<dyn Executor>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.executors.entry(action_type) {
            Entry::Occupied(_) => Err(DeployError::already_registered("executor", action_type.as_str())),
            Entry::Vacant(slot) => {
                slot.insert(executor);
                Ok(())
            }
        }
    }

    pub fn get(&self, action_type: ActionType) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(&action_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeployError::not_found("executor", action_type.as_str()))
    }

    pub fn contains(&self, action_type: ActionType) -> bool {
        self.executors.contains_key(&action_type)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one action: Pending -> Doing -> Done/Failed, then write its log.
///
/// The status is always terminal when this returns, unless the action had
/// already been started elsewhere, in which case it is left untouched.
pub async fn run_action(registry: &ExecutorRegistry, action: Arc<Action>, ctx: &ExecContext) {
    if let Err(e) = action.begin() {
        warn!(action = %action.name(), error = %e, "refusing to execute action twice");
        return;
    }
    debug!(action = %action.name(), kind = %action.action_type(), node = %action.node().name, "action started");

    let result = match registry.get(action.action_type()) {
        Ok(executor) => {
            let fut = executor.execute(&action, ctx);
            match ctx.config.action_timeout {
                Some(limit) => match timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(DeployError::timeout(
                        format!("action {}", action.name()),
                        limit.as_millis() as u64,
                    )),
                },
                None => fut.await,
            }
        }
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) => info!(action = %action.name(), kind = %action.action_type(), "action done"),
        Err(e) => warn!(
            action = %action.name(),
            kind = %action.action_type(),
            category = e.category(),
            error = %e,
            "action failed"
        ),
    }
    if let Err(e) = action.finish(result.map_err(|e| e.detail())) {
        warn!(action = %action.name(), error = %e, "action state corrupted");
    }

    if let Err(e) = write_log(&action).await {
        warn!(action = %action.name(), path = %action.log_path().display(), error = %e, "writing action log failed");
    }
}

async fn write_log(action: &Action) -> Result<()> {
    let path = action.log_path();
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DeployError::io(format!("create {}", dir.display()), e))?;
    }
    tokio::fs::write(path, action.render_log())
        .await
        .map_err(|e| DeployError::io(format!("write {}", path.display()), e))
}
