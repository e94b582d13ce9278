//! Request-facing surface: validates requests, builds root tasks, stores
//! them and launches the driver in the background.
//!
//! Every operation replies immediately; progress is observed through
//! [`Controller::get_result`] and [`Controller::get_log`].

pub mod dto;
pub mod logs;
pub mod projection;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use dto::{
    AddNodesRequest, AppendLabelRequest, DeployRequest, FetchKubeConfigRequest, LogRequest, NodesRequest, Reply,
    ResultRecord, ResultRequest, TaskReport,
};
pub use projection::Stage;

use crate::action::ExecutorRegistry;
use crate::certs::RcgenIssuer;
use crate::core::{DeployError, EngineConfig, ErrorDetail, Result};
use crate::driver::Driver;
use crate::machine::MachineConnector;
use crate::store::Store;
use crate::task::{ProcessorRegistry, Task, TaskStatus, TaskType};

struct Launch {
    cancel: CancellationToken,
    finished: watch::Receiver<Option<TaskStatus>>,
}

impl Launch {
    fn is_running(&self) -> bool {
        self.finished.borrow().is_none()
    }
}

/// Store key of a non-deploy operation over `base`
pub fn task_name(base: &str, task_type: TaskType) -> String {
    format!("{base}-{task_type}")
}

pub struct Controller {
    store: Arc<Store>,
    driver: Driver,
    launches: DashMap<String, Launch>,
}

impl Controller {
    pub fn new(driver: Driver) -> Self {
        Self {
            store: Arc::new(Store::new()),
            driver,
            launches: DashMap::new(),
        }
    }

    /// A controller with every built-in processor and executor
    pub fn with_connector(connector: Arc<dyn MachineConnector>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let driver = Driver::new(
            Arc::new(ProcessorRegistry::with_defaults()?),
            Arc::new(ExecutorRegistry::with_defaults()?),
            connector,
            Arc::new(RcgenIssuer),
            Arc::new(config),
        );
        Ok(Self::new(driver))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Deploy a new cluster. The cluster name must not be in use.
    pub fn deploy(&self, request: DeployRequest) -> Reply {
        let name = request.cluster.name.clone();
        let result = Task::new_deploy(&name, request.cluster, request.nodes, self.log_root())
            .and_then(|task| self.store.add_task(task.clone()).map(|_| task));
        match result {
            Ok(task) => {
                self.prune();
                self.launches.insert(name.clone(), self.start(task));
                Reply::accepted(name)
            }
            Err(e) => self.reject("deploy", &name, e),
        }
    }

    pub fn check_nodes(&self, request: NodesRequest) -> Reply {
        let name = task_name(&request.name, TaskType::NodeCheck);
        self.relaunch("node check", &name, || {
            Task::new_node_check(&name, request.nodes, self.log_root())
        })
    }

    pub fn check_connectivity(&self, request: NodesRequest) -> Reply {
        let name = task_name(&request.name, TaskType::ConnectivityCheck);
        self.relaunch("connectivity check", &name, || {
            Task::new_connectivity_check(&name, request.nodes, self.log_root())
        })
    }

    pub fn test_connection(&self, request: NodesRequest) -> Reply {
        let name = task_name(&request.name, TaskType::TestConnection);
        self.relaunch("test connection", &name, || {
            Task::new_test_connection(&name, request.nodes, self.log_root())
        })
    }

    /// Join extra worker nodes to a running cluster
    pub fn add_nodes(&self, request: AddNodesRequest) -> Reply {
        let name = task_name(&request.cluster.name, TaskType::DeployNode);
        self.relaunch("add nodes", &name, || {
            Task::new_add_nodes(&name, request.cluster, request.nodes, request.first_master, self.log_root())
        })
    }

    pub fn fetch_kubeconfig(&self, request: FetchKubeConfigRequest) -> Reply {
        let name = task_name(&request.cluster_name, TaskType::FetchKubeConfig);
        self.relaunch("fetch kubeconfig", &name, || {
            Task::new_fetch_kubeconfig(&name, request.master, self.log_root())
        })
    }

    pub fn append_labels(&self, request: AppendLabelRequest) -> Reply {
        let name = task_name(&request.cluster_name, TaskType::AppendLabel);
        self.relaunch("append label", &name, || {
            Task::new_append_label(&name, request.master, request.nodes, request.labels, self.log_root())
        })
    }

    /// Status, counts and per-action records of a stored task
    pub fn get_result(&self, request: &ResultRequest) -> Result<TaskReport> {
        let task = self.store.get_task(&request.task)?;
        Ok(TaskReport {
            task: task.name().to_string(),
            status: task.status(),
            error: task.error(),
            summary: task.summary(),
            records: projection::project_stage(&task, request.stage),
        })
    }

    /// Logs of every action of `request.node`, optionally limited to one stage
    pub async fn get_log(&self, request: &LogRequest) -> Result<String> {
        let task = self.store.get_task(&request.task)?;
        let actions: Vec<_> = task
            .all_actions()
            .into_iter()
            .filter(|action| action.node().name == request.node)
            .filter(|action| request.stage.map_or(true, |stage| stage.matches(action)))
            .collect();
        logs::collect_logs(&actions).await
    }

    /// Ask a running task to stop. Unstarted work stays `Pending`.
    pub fn cancel(&self, name: &str) -> Reply {
        match self.launches.get(name) {
            Some(launch) if launch.is_running() => {
                info!(task = %name, "cancel requested");
                launch.cancel.cancel();
                Reply::accepted(name)
            }
            Some(_) => Self::finished(name),
            None if self.store.contains(name) => Self::finished(name),
            None => Reply::from(DeployError::TaskMissing { name: name.to_string() }),
        }
    }

    /// Wait for a launched task to reach a terminal status
    pub async fn wait(&self, name: &str) -> Result<TaskStatus> {
        let Some(mut finished) = self.launches.get(name).map(|launch| launch.finished.clone()) else {
            // A pruned launch leaves its finished task in the store
            return Ok(self.store.get_task(name)?.status());
        };
        let status = *finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DeployError::internal(format!("driver for {name} stopped without a status")))?;
        status.ok_or_else(|| DeployError::internal(format!("no status for {name}")))
    }

    fn log_root(&self) -> &std::path::Path {
        &self.driver.config().log_dir
    }

    /// Build and store a task that may replace a finished one of the same name
    fn relaunch(&self, operation: &str, name: &str, build: impl FnOnce() -> Result<Arc<Task>>) -> Reply {
        self.prune();
        // The entry stays locked until the new launch is in place
        let entry = match self.launches.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().is_running() => {
                drop(entry);
                return self.reject(operation, name, DeployError::TaskExists { name: name.to_string() });
            }
            entry => entry,
        };
        match build() {
            Ok(task) => {
                self.store.update_or_add_task(task.clone());
                entry.insert(self.start(task));
                Reply::accepted(name)
            }
            Err(e) => {
                drop(entry);
                self.reject(operation, name, e)
            }
        }
    }

    /// Spawn the driver over `task`
    fn start(&self, task: Arc<Task>) -> Launch {
        let cancel = CancellationToken::new();
        let (done, finished) = watch::channel(None);
        let driver = self.driver.clone();
        info!(task = %task.name(), task_type = %task.task_type(), "task accepted");
        let token = cancel.clone();
        tokio::spawn(async move {
            let status = driver.run_with_cancel(task, token).await;
            let _ = done.send(Some(status));
        });
        Launch { cancel, finished }
    }

    /// Forget launches whose driver has finished; their tasks stay in the store
    fn prune(&self) {
        self.launches.retain(|_, launch| launch.is_running());
    }

    fn finished(name: &str) -> Reply {
        Reply::rejected(ErrorDetail::new(
            "task finished",
            format!("task {name} is no longer running"),
            "query its result instead",
        ))
    }

    fn reject(&self, operation: &str, name: &str, error: DeployError) -> Reply {
        warn!(task = %name, operation, error = %error, "request rejected");
        Reply::from(error)
    }
}
