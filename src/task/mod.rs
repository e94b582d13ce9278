//! Tasks: composite nodes of the deployment tree.
//!
//! A task holds either sub-tasks or actions, never both. It is created
//! `Pending`, filled by its processor during the split, driven, and finally
//! rolled up from its children. Like actions, tasks are shared behind `Arc`
//! and keep mutable state under a lock so the tree can be inspected while it
//! runs.

pub mod processor;
pub mod processors;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::action::{Action, ActionStatus};
use crate::core::{DeployError, ErrorDetail, Result};
use crate::model::{ClusterConfig, NodeConfig};

pub use processor::{Processor, ProcessorRegistry, SplitContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Deploy,
    NodeInit,
    DeployEtcd,
    DeployMaster,
    InitMaster,
    JoinMaster,
    DeployConfig,
    DeployWorker,
    DeployIngress,
    DeployNode,
    NodeCheck,
    ConnectivityCheck,
    TestConnection,
    FetchKubeConfig,
    AppendLabel,
}

impl TaskType {
    pub const ALL: [TaskType; 15] = [
        TaskType::Deploy,
        TaskType::NodeInit,
        TaskType::DeployEtcd,
        TaskType::DeployMaster,
        TaskType::InitMaster,
        TaskType::JoinMaster,
        TaskType::DeployConfig,
        TaskType::DeployWorker,
        TaskType::DeployIngress,
        TaskType::DeployNode,
        TaskType::NodeCheck,
        TaskType::ConnectivityCheck,
        TaskType::TestConnection,
        TaskType::FetchKubeConfig,
        TaskType::AppendLabel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Deploy => "deploy",
            TaskType::NodeInit => "node-init",
            TaskType::DeployEtcd => "deploy-etcd",
            TaskType::DeployMaster => "deploy-master",
            TaskType::InitMaster => "init-master",
            TaskType::JoinMaster => "join-master",
            TaskType::DeployConfig => "deploy-config",
            TaskType::DeployWorker => "deploy-worker",
            TaskType::DeployIngress => "deploy-ingress",
            TaskType::DeployNode => "deploy-node",
            TaskType::NodeCheck => "node-check",
            TaskType::ConnectivityCheck => "connectivity-check",
            TaskType::TestConnection => "test-connection",
            TaskType::FetchKubeConfig => "fetch-kubeconfig",
            TaskType::AppendLabel => "append-label",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Splitting,
    Splitted,
    Doing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Per-type payload of a task. The tag is [`TaskType`].
#[derive(Debug, Clone)]
pub enum TaskKind {
    Deploy {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
    },
    NodeInit {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
    },
    DeployEtcd {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
    },
    DeployMaster {
        cluster: Arc<ClusterConfig>,
        masters: Vec<NodeConfig>,
        etcd_nodes: Vec<NodeConfig>,
    },
    InitMaster {
        cluster: Arc<ClusterConfig>,
        masters: Arc<Vec<NodeConfig>>,
        etcd_nodes: Arc<Vec<NodeConfig>>,
    },
    JoinMaster {
        cluster: Arc<ClusterConfig>,
        node: NodeConfig,
        first_master: NodeConfig,
    },
    DeployConfig {
        cluster: Arc<ClusterConfig>,
        master: NodeConfig,
    },
    DeployWorker {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
        first_master: NodeConfig,
    },
    DeployIngress {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
        first_master: NodeConfig,
    },
    DeployNode {
        cluster: Arc<ClusterConfig>,
        nodes: Vec<NodeConfig>,
        first_master: NodeConfig,
    },
    NodeCheck {
        nodes: Vec<NodeConfig>,
    },
    ConnectivityCheck {
        nodes: Vec<NodeConfig>,
    },
    TestConnection {
        nodes: Vec<NodeConfig>,
    },
    FetchKubeConfig {
        master: NodeConfig,
    },
    AppendLabel {
        master: NodeConfig,
        nodes: Vec<NodeConfig>,
        labels: BTreeMap<String, String>,
    },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::Deploy { .. } => TaskType::Deploy,
            TaskKind::NodeInit { .. } => TaskType::NodeInit,
            TaskKind::DeployEtcd { .. } => TaskType::DeployEtcd,
            TaskKind::DeployMaster { .. } => TaskType::DeployMaster,
            TaskKind::InitMaster { .. } => TaskType::InitMaster,
            TaskKind::JoinMaster { .. } => TaskType::JoinMaster,
            TaskKind::DeployConfig { .. } => TaskType::DeployConfig,
            TaskKind::DeployWorker { .. } => TaskType::DeployWorker,
            TaskKind::DeployIngress { .. } => TaskType::DeployIngress,
            TaskKind::DeployNode { .. } => TaskType::DeployNode,
            TaskKind::NodeCheck { .. } => TaskType::NodeCheck,
            TaskKind::ConnectivityCheck { .. } => TaskType::ConnectivityCheck,
            TaskKind::TestConnection { .. } => TaskType::TestConnection,
            TaskKind::FetchKubeConfig { .. } => TaskType::FetchKubeConfig,
            TaskKind::AppendLabel { .. } => TaskType::AppendLabel,
        }
    }
}

/// Action counts by status over a whole task tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub doing: usize,
    pub done: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    error: Option<ErrorDetail>,
    sub_tasks: Vec<Arc<Task>>,
    actions: Vec<Arc<Action>>,
}

#[derive(Debug)]
pub struct Task {
    name: String,
    kind: TaskKind,
    priority: u32,
    parent: Option<String>,
    failure_can_be_ignored: bool,
    root_log_dir: PathBuf,
    log_dir: PathBuf,
    created_at: DateTime<Utc>,
    state: RwLock<TaskState>,
}

impl Task {
    fn root(name: String, kind: TaskKind, log_root: &Path) -> Arc<Task> {
        let root_log_dir = log_root.join(&name);
        Arc::new(Task {
            log_dir: root_log_dir.clone(),
            root_log_dir,
            name,
            kind,
            priority: 0,
            parent: None,
            failure_can_be_ignored: false,
            created_at: Utc::now(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                error: None,
                sub_tasks: Vec::new(),
                actions: Vec::new(),
            }),
        })
    }

    /// A pending child of this task, logging under `<root>/<name>`
    pub fn child(&self, name: impl Into<String>, kind: TaskKind, priority: u32, failure_can_be_ignored: bool) -> Arc<Task> {
        let name = name.into();
        Arc::new(Task {
            log_dir: self.root_log_dir.join(&name),
            root_log_dir: self.root_log_dir.clone(),
            name,
            kind,
            priority,
            parent: Some(self.name.clone()),
            failure_can_be_ignored,
            created_at: Utc::now(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                error: None,
                sub_tasks: Vec::new(),
                actions: Vec::new(),
            }),
        })
    }

    /// Full cluster deployment. Generates join secrets when absent.
    pub fn new_deploy(name: impl Into<String>, mut cluster: ClusterConfig, nodes: Vec<NodeConfig>, log_root: &Path) -> Result<Arc<Task>> {
        cluster.validate()?;
        validate_nodes(&nodes, "deploy")?;
        cluster.ensure_join_secrets();
        Ok(Self::root(
            name.into(),
            TaskKind::Deploy {
                cluster: Arc::new(cluster),
                nodes,
            },
            log_root,
        ))
    }

    pub fn new_node_check(name: impl Into<String>, nodes: Vec<NodeConfig>, log_root: &Path) -> Result<Arc<Task>> {
        validate_nodes(&nodes, "node check")?;
        Ok(Self::root(name.into(), TaskKind::NodeCheck { nodes }, log_root))
    }

    pub fn new_connectivity_check(name: impl Into<String>, nodes: Vec<NodeConfig>, log_root: &Path) -> Result<Arc<Task>> {
        validate_nodes(&nodes, "connectivity check")?;
        Ok(Self::root(name.into(), TaskKind::ConnectivityCheck { nodes }, log_root))
    }

    pub fn new_test_connection(name: impl Into<String>, nodes: Vec<NodeConfig>, log_root: &Path) -> Result<Arc<Task>> {
        validate_nodes(&nodes, "test connection")?;
        Ok(Self::root(name.into(), TaskKind::TestConnection { nodes }, log_root))
    }

    /// Join extra workers to a running cluster whose join secrets are known
    pub fn new_add_nodes(
        name: impl Into<String>,
        cluster: ClusterConfig,
        nodes: Vec<NodeConfig>,
        first_master: NodeConfig,
        log_root: &Path,
    ) -> Result<Arc<Task>> {
        cluster.validate()?;
        validate_nodes(&nodes, "worker")?;
        if cluster.bootstrap_token.is_none() {
            return Err(DeployError::config_field(
                "required to join an existing cluster",
                "cluster.bootstrap_token",
            ));
        }
        Ok(Self::root(
            name.into(),
            TaskKind::DeployNode {
                cluster: Arc::new(cluster),
                nodes,
                first_master,
            },
            log_root,
        ))
    }

    pub fn new_fetch_kubeconfig(name: impl Into<String>, master: NodeConfig, log_root: &Path) -> Result<Arc<Task>> {
        validate_nodes(std::slice::from_ref(&master), "master")?;
        Ok(Self::root(name.into(), TaskKind::FetchKubeConfig { master }, log_root))
    }

    pub fn new_append_label(
        name: impl Into<String>,
        master: NodeConfig,
        nodes: Vec<NodeConfig>,
        labels: BTreeMap<String, String>,
        log_root: &Path,
    ) -> Result<Arc<Task>> {
        validate_nodes(&nodes, "label")?;
        if labels.is_empty() {
            return Err(DeployError::config_field("no labels given", "labels"));
        }
        Ok(Self::root(
            name.into(),
            TaskKind::AppendLabel { master, nodes, labels },
            log_root,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn failure_can_be_ignored(&self) -> bool {
        self.failure_can_be_ignored
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn error(&self) -> Option<ErrorDetail> {
        self.state.read().error.clone()
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.state.write().status = status;
    }

    pub fn succeed(&self) {
        let mut state = self.state.write();
        state.status = TaskStatus::Done;
        state.error = None;
    }

    pub fn fail(&self, error: ErrorDetail) {
        let mut state = self.state.write();
        state.status = TaskStatus::Failed;
        state.error = Some(error);
    }

    pub fn has_children(&self) -> bool {
        let state = self.state.read();
        !state.sub_tasks.is_empty() || !state.actions.is_empty()
    }

    /// Sub-tasks in priority order; insertion order within a priority
    pub fn sub_tasks(&self) -> Vec<Arc<Task>> {
        let mut sub_tasks = self.state.read().sub_tasks.clone();
        sub_tasks.sort_by_key(|task| task.priority);
        sub_tasks
    }

    pub fn actions(&self) -> Vec<Arc<Action>> {
        self.state.read().actions.clone()
    }

    pub fn attach_sub_tasks(&self, sub_tasks: Vec<Arc<Task>>) -> Result<()> {
        let mut state = self.state.write();
        if !state.actions.is_empty() || !state.sub_tasks.is_empty() {
            return Err(DeployError::internal(format!("task {} already split", self.name)));
        }
        state.sub_tasks = sub_tasks;
        Ok(())
    }

    pub fn attach_actions(&self, actions: Vec<Arc<Action>>) -> Result<()> {
        let mut state = self.state.write();
        if !state.actions.is_empty() || !state.sub_tasks.is_empty() {
            return Err(DeployError::internal(format!("task {} already split", self.name)));
        }
        state.actions = actions;
        Ok(())
    }

    /// Every action in the tree, depth first, sub-tasks in priority order
    pub fn all_actions(&self) -> Vec<Arc<Action>> {
        let mut out = self.actions();
        for sub_task in self.sub_tasks() {
            out.extend(sub_task.all_actions());
        }
        out
    }

    pub fn find(&self, name: &str) -> Option<Arc<Task>> {
        for sub_task in self.sub_tasks() {
            if sub_task.name == name {
                return Some(sub_task);
            }
            if let Some(found) = sub_task.find(name) {
                return Some(found);
            }
        }
        None
    }

    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for action in self.all_actions() {
            summary.total += 1;
            match action.status() {
                ActionStatus::Pending => summary.pending += 1,
                ActionStatus::Doing => summary.doing += 1,
                ActionStatus::Done => summary.done += 1,
                ActionStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

fn validate_nodes(nodes: &[NodeConfig], role: &str) -> Result<()> {
    if nodes.is_empty() {
        return Err(DeployError::empty_nodes(role));
    }
    let mut seen = HashSet::new();
    for node in nodes {
        if node.name.trim().is_empty() || node.ip.trim().is_empty() {
            return Err(DeployError::config_field("node name and ip are required", "nodes"));
        }
        if !seen.insert(node.name.as_str()) {
            return Err(DeployError::config_field(format!("duplicate node {}", node.name), "nodes"));
        }
    }
    Ok(())
}
