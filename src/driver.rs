//! Drives a task tree: split, run bands of sub-tasks or a batch of actions,
//! then roll the children up into the task's status.

use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::action::{run_action, Action, ActionStatus, ExecContext, ExecutorRegistry};
use crate::certs::CertIssuer;
use crate::core::errors::HINT_CHECK_REACHABILITY;
use crate::core::{DeployError, EngineConfig, ErrorDetail};
use crate::machine::MachineConnector;
use crate::task::{ProcessorRegistry, SplitContext, Task, TaskStatus};

#[derive(Clone)]
pub struct Driver {
    processors: Arc<ProcessorRegistry>,
    executors: Arc<ExecutorRegistry>,
    exec: ExecContext,
    split: SplitContext,
}

impl Driver {
    pub fn new(
        processors: Arc<ProcessorRegistry>,
        executors: Arc<ExecutorRegistry>,
        connector: Arc<dyn MachineConnector>,
        issuer: Arc<dyn CertIssuer>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            processors,
            executors,
            exec: ExecContext::new(connector, config.clone()),
            split: SplitContext::new(issuer, config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.exec.config
    }

    /// Drive `task` to a terminal status
    #[instrument(skip_all, fields(task = %task.name()))]
    pub async fn run(&self, task: Arc<Task>) -> TaskStatus {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Drive `task` until done or until `cancel` fires.
    ///
    /// A configured `deploy_timeout` cancels the token when it elapses.
    /// Bands that have not started by then stay `Pending`.
    #[instrument(skip_all, fields(task = %task.name()))]
    pub async fn run_with_cancel(&self, task: Arc<Task>, cancel: CancellationToken) -> TaskStatus {
        let deadline = self.exec.config.deploy_timeout.map(|limit| {
            let token = cancel.clone();
            let task_name = task.name().to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(task = %task_name, timeout_ms = limit.as_millis() as u64, "deploy deadline reached, cancelling");
                        token.cancel();
                    }
                }
            })
        });

        let ctx = self.exec.with_cancel(cancel);
        let status = self.clone().drive(task.clone(), ctx).await;
        if let Some(timer) = deadline {
            timer.abort();
        }

        match status {
            TaskStatus::Done => info!(task = %task.name(), summary = ?task.summary(), "task done"),
            _ => warn!(task = %task.name(), error = ?task.error(), summary = ?task.summary(), "task failed"),
        }
        status
    }

    fn drive(self, task: Arc<Task>, ctx: ExecContext) -> BoxFuture<'static, TaskStatus> {
        async move {
            if !task.has_children() {
                task.set_status(TaskStatus::Splitting);
                if let Err(e) = self.processors.split_task(&task, &self.split) {
                    error!(task = %task.name(), error = %e, "split failed");
                    task.fail(DeployError::split_failed(task.name(), e.to_string()).detail());
                    return TaskStatus::Failed;
                }
                task.set_status(TaskStatus::Splitted);
                debug!(
                    task = %task.name(),
                    sub_tasks = task.sub_tasks().len(),
                    actions = task.actions().len(),
                    "split"
                );
            }
            task.set_status(TaskStatus::Doing);

            let sub_tasks = task.sub_tasks();
            if !sub_tasks.is_empty() {
                self.run_bands(&task, sub_tasks, &ctx).await;
            } else {
                self.run_actions(&task, task.actions(), &ctx).await;
            }

            roll_up(&task, &ctx);
            task.status()
        }
        .boxed()
    }

    /// Run sub-tasks band by band in ascending priority
    async fn run_bands(&self, task: &Task, sub_tasks: Vec<Arc<Task>>, ctx: &ExecContext) {
        let mut bands: BTreeMap<u32, Vec<Arc<Task>>> = BTreeMap::new();
        for sub_task in sub_tasks {
            bands.entry(sub_task.priority()).or_default().push(sub_task);
        }

        for (priority, band) in bands {
            if ctx.cancel.is_cancelled() {
                warn!(task = %task.name(), priority, "cancelled before band");
                return;
            }
            debug!(task = %task.name(), priority, size = band.len(), "band started");
            let handles = band.iter().map(|sub_task| {
                let driver = self.clone();
                let sub_task = sub_task.clone();
                let ctx = ctx.clone();
                tokio::spawn(driver.drive(sub_task, ctx))
            });
            for (sub_task, joined) in band.iter().zip(join_all(handles).await) {
                if let Err(e) = joined {
                    error!(task = %sub_task.name(), error = %e, "sub-task panicked");
                    sub_task.fail(DeployError::internal(format!("sub-task {} panicked", sub_task.name())).detail());
                }
            }

            let blocking: Vec<&str> = band
                .iter()
                .filter(|sub_task| sub_task.status() != TaskStatus::Done && !sub_task.failure_can_be_ignored())
                .map(|sub_task| sub_task.name())
                .collect();
            if !blocking.is_empty() {
                warn!(task = %task.name(), priority, failed = ?blocking, "band failed, skipping later bands");
                return;
            }
            for ignored in band.iter().filter(|sub_task| sub_task.status() == TaskStatus::Failed) {
                warn!(task = %ignored.name(), "ignoring failure");
            }
        }
    }

    /// Run every action concurrently and wait for all of them
    async fn run_actions(&self, task: &Task, actions: Vec<Arc<Action>>, ctx: &ExecContext) {
        if ctx.cancel.is_cancelled() {
            warn!(task = %task.name(), "cancelled before actions");
            return;
        }
        let handles = actions.iter().map(|action| {
            let executors = self.executors.clone();
            let action = action.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { run_action(&executors, action, &ctx).await })
        });
        for (action, joined) in actions.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                error!(action = %action.name(), error = %e, "executor panicked");
                let _ = action.finish(Err(DeployError::internal(format!("executor panicked: {e}")).detail()));
            }
        }
    }
}

/// Done iff every non-ignorable child is Done
fn roll_up(task: &Task, ctx: &ExecContext) {
    let sub_tasks = task.sub_tasks();
    let children: Vec<(String, bool, bool)> = if sub_tasks.is_empty() {
        task.actions()
            .iter()
            .map(|a| (a.name().to_string(), a.status() == ActionStatus::Done, a.status() == ActionStatus::Failed))
            .collect()
    } else {
        sub_tasks
            .iter()
            .filter(|t| !t.failure_can_be_ignored())
            .map(|t| (t.name().to_string(), t.status() == TaskStatus::Done, t.status() == TaskStatus::Failed))
            .collect()
    };

    if children.iter().all(|(_, done, _)| *done) {
        task.succeed();
        return;
    }
    let failed: Vec<String> = children
        .into_iter()
        .filter(|(_, _, failed)| *failed)
        .map(|(name, _, _)| name)
        .collect();
    if failed.is_empty() && ctx.cancel.is_cancelled() {
        task.fail(DeployError::cancelled(format!("task {}", task.name())).detail());
    } else if failed.is_empty() {
        task.fail(ErrorDetail::new(
            "incomplete",
            format!("task {} finished with unfinished children", task.name()),
            HINT_CHECK_REACHABILITY,
        ));
    } else {
        task.fail(DeployError::items_failed(failed).detail());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::RcgenIssuer;
    use crate::machine::{ScriptedConnector, ScriptedResponse};
    use crate::model::NodeConfig;
    use std::time::Duration;

    fn driver(connector: &ScriptedConnector, dir: &std::path::Path) -> Driver {
        let mut config = EngineConfig::development();
        config.log_dir = dir.to_path_buf();
        Driver::new(
            Arc::new(ProcessorRegistry::with_defaults().unwrap()),
            Arc::new(ExecutorRegistry::with_defaults().unwrap()),
            Arc::new(connector.clone()),
            Arc::new(RcgenIssuer),
            Arc::new(config),
        )
    }

    fn nodes(count: usize) -> Vec<NodeConfig> {
        (1..=count)
            .map(|i| NodeConfig::new(format!("n{i}"), format!("10.0.0.{i}")))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leaf_failure_rolls_up_names() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.set_unreachable("n2");
        let driver = driver(&connector, dir.path());
        let task = Task::new_test_connection("conn", nodes(3), dir.path()).unwrap();

        assert_eq!(driver.run(task.clone()).await, TaskStatus::Failed);
        let error = task.error().unwrap();
        assert_eq!(error.reason, "items failed");
        assert_eq!(error.detail, "1 item(s) failed: [n2]");
        let statuses: Vec<ActionStatus> = task.actions().iter().map(|a| a.status()).collect();
        assert_eq!(statuses, vec![ActionStatus::Done, ActionStatus::Failed, ActionStatus::Done]);
        assert!(task.actions()[1].log_path().exists());
    }

    #[tokio::test]
    async fn test_empty_split_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let task = Task::new_connectivity_check("conn", nodes(1), dir.path()).unwrap();
        assert_eq!(driver(&connector, dir.path()).run(task.clone()).await, TaskStatus::Done);
        assert!(task.actions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_actions_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.respond(None, "hostname", ScriptedResponse::ok("h").with_delay(Duration::from_millis(100)));
        let task = Task::new_test_connection("conn", nodes(5), dir.path()).unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(driver(&connector, dir.path()).run(task).await, TaskStatus::Done);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_actions_pending() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let task = Task::new_test_connection("conn", nodes(2), dir.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = driver(&connector, dir.path()).run_with_cancel(task.clone(), cancel).await;
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(task.error().unwrap().reason, "cancelled");
        assert!(task.actions().iter().all(|a| a.status() == ActionStatus::Pending));
    }

    #[tokio::test]
    async fn test_deploy_timeout_cancels_running_actions() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.respond(None, "hostname", ScriptedResponse::ok("h").with_delay(Duration::from_secs(30)));
        let mut config = EngineConfig::development();
        config.log_dir = dir.path().to_path_buf();
        config.deploy_timeout = Some(Duration::from_millis(50));
        let driver = Driver::new(
            Arc::new(ProcessorRegistry::with_defaults().unwrap()),
            Arc::new(ExecutorRegistry::with_defaults().unwrap()),
            Arc::new(connector.clone()),
            Arc::new(RcgenIssuer),
            Arc::new(config),
        );
        let task = Task::new_test_connection("conn", nodes(1), dir.path()).unwrap();

        assert_eq!(driver.run(task.clone()).await, TaskStatus::Failed);
        let action = &task.actions()[0];
        assert_eq!(action.status(), ActionStatus::Failed);
        assert_eq!(action.error().unwrap().reason, "cancelled");
    }
}
