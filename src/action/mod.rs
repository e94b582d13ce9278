//! Actions: the smallest unit of work, bound to one node.
//!
//! An [`Action`] is created `Pending` when its task is split, moved to `Doing`
//! exactly once by [`executor::run_action`], and finishes `Done` or `Failed`.
//! Mutable state sits behind locks so that the result and log can be read
//! while the action is still running.

pub mod executor;
pub mod executors;
pub mod session;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::certs::CertPair;
use crate::core::{CheckItem, DeployError, ErrorDetail, NodeRequirements, Result};
use crate::model::{ClusterConfig, NodeConfig};

pub use executor::{run_action, ExecContext, Executor, ExecutorRegistry};
pub use session::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    TestConnection,
    NodeCheck,
    ConnectivityCheck,
    NodeInit,
    DeployEtcd,
    InitMaster,
    JoinMaster,
    DeployWorker,
    DeployNode,
    DeployIngress,
    DeployContour,
    DeployConfig,
    FetchKubeConfig,
    AppendLabel,
}

impl ActionType {
    pub const ALL: [ActionType; 14] = [
        ActionType::TestConnection,
        ActionType::NodeCheck,
        ActionType::ConnectivityCheck,
        ActionType::NodeInit,
        ActionType::DeployEtcd,
        ActionType::InitMaster,
        ActionType::JoinMaster,
        ActionType::DeployWorker,
        ActionType::DeployNode,
        ActionType::DeployIngress,
        ActionType::DeployContour,
        ActionType::DeployConfig,
        ActionType::FetchKubeConfig,
        ActionType::AppendLabel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::TestConnection => "test-connection",
            ActionType::NodeCheck => "node-check",
            ActionType::ConnectivityCheck => "connectivity-check",
            ActionType::NodeInit => "node-init",
            ActionType::DeployEtcd => "deploy-etcd",
            ActionType::InitMaster => "init-master",
            ActionType::JoinMaster => "join-master",
            ActionType::DeployWorker => "deploy-worker",
            ActionType::DeployNode => "deploy-node",
            ActionType::DeployIngress => "deploy-ingress",
            ActionType::DeployContour => "deploy-contour",
            ActionType::DeployConfig => "deploy-config",
            ActionType::FetchKubeConfig => "fetch-kubeconfig",
            ActionType::AppendLabel => "append-label",
        }
    }

    /// Cluster-wide actions are named after their type, not their node
    pub fn is_cluster_wide(&self) -> bool {
        matches!(
            self,
            ActionType::DeployContour | ActionType::DeployConfig | ActionType::FetchKubeConfig
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    Doing,
    Done,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Done | ActionStatus::Failed)
    }
}

/// Failure tier of a single item inside an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemErrorKind {
    /// The item could not be created (missing input, no session)
    Empty,
    /// The command for the item could not be built
    Operation,
    /// The command ran and failed
    Script,
}

/// One sub-step of an action (a probe port, an init step, a check)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub name: String,
    pub status: ActionStatus,
    pub error_kind: Option<ItemErrorKind>,
    pub error: Option<ErrorDetail>,
}

impl ActionItem {
    pub fn done(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ActionStatus::Done,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, kind: ItemErrorKind, error: ErrorDetail) -> Self {
        Self {
            name: name.into(),
            status: ActionStatus::Failed,
            error_kind: Some(kind),
            error: Some(error),
        }
    }
}

/// Record of one remote operation, appended to the action's execution log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandRecord {
    fn render(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "[{} - {}] $ {}",
            self.started_at.to_rfc3339(),
            self.finished_at.to_rfc3339(),
            self.command
        );
        if !self.stdout.is_empty() {
            let _ = writeln!(out, "stdout:\n{}", self.stdout.trim_end());
        }
        if !self.stderr.is_empty() {
            let _ = writeln!(out, "stderr:\n{}", self.stderr.trim_end());
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "error: {error}");
        }
    }
}

/// Per-kind payload of an action. The tag is [`ActionType`].
#[derive(Debug, Clone)]
pub enum ActionKind {
    TestConnection,
    NodeCheck {
        requirements: NodeRequirements,
    },
    ConnectivityCheck {
        destination: NodeConfig,
        items: Vec<CheckItem>,
    },
    NodeInit {
        cluster: Arc<ClusterConfig>,
    },
    DeployEtcd {
        cluster: Arc<ClusterConfig>,
        peers: Arc<Vec<NodeConfig>>,
        ca: Arc<CertPair>,
        client: Arc<CertPair>,
        server: CertPair,
        peer: CertPair,
    },
    InitMaster {
        cluster: Arc<ClusterConfig>,
        etcd_nodes: Arc<Vec<NodeConfig>>,
        masters: Arc<Vec<NodeConfig>>,
    },
    JoinMaster {
        cluster: Arc<ClusterConfig>,
        first_master: NodeConfig,
    },
    DeployWorker {
        cluster: Arc<ClusterConfig>,
        first_master: NodeConfig,
    },
    DeployNode {
        cluster: Arc<ClusterConfig>,
        first_master: NodeConfig,
    },
    DeployIngress {
        cluster: Arc<ClusterConfig>,
        first_master: NodeConfig,
    },
    DeployContour {
        cluster: Arc<ClusterConfig>,
    },
    DeployConfig {
        cluster: Arc<ClusterConfig>,
    },
    FetchKubeConfig {
        destination: PathBuf,
    },
    /// Labels the action's node; kubectl runs on `master`
    AppendLabel {
        master: NodeConfig,
        labels: BTreeMap<String, String>,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionKind::TestConnection => ActionType::TestConnection,
            ActionKind::NodeCheck { .. } => ActionType::NodeCheck,
            ActionKind::ConnectivityCheck { .. } => ActionType::ConnectivityCheck,
            ActionKind::NodeInit { .. } => ActionType::NodeInit,
            ActionKind::DeployEtcd { .. } => ActionType::DeployEtcd,
            ActionKind::InitMaster { .. } => ActionType::InitMaster,
            ActionKind::JoinMaster { .. } => ActionType::JoinMaster,
            ActionKind::DeployWorker { .. } => ActionType::DeployWorker,
            ActionKind::DeployNode { .. } => ActionType::DeployNode,
            ActionKind::DeployIngress { .. } => ActionType::DeployIngress,
            ActionKind::DeployContour { .. } => ActionType::DeployContour,
            ActionKind::DeployConfig { .. } => ActionType::DeployConfig,
            ActionKind::FetchKubeConfig { .. } => ActionType::FetchKubeConfig,
            ActionKind::AppendLabel { .. } => ActionType::AppendLabel,
        }
    }
}

#[derive(Debug)]
struct ActionState {
    status: ActionStatus,
    error: Option<ErrorDetail>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Action {
    name: String,
    task: String,
    node: NodeConfig,
    kind: ActionKind,
    log_path: PathBuf,
    created_at: DateTime<Utc>,
    state: Mutex<ActionState>,
    // concurrent sub-items append here
    items: Mutex<Vec<ActionItem>>,
    log: Mutex<Vec<CommandRecord>>,
}

impl Action {
    /// Create a pending action owned by `task`, logging under `log_dir`
    pub fn new(task: impl Into<String>, log_dir: &Path, node: NodeConfig, kind: ActionKind) -> Self {
        let action_type = kind.action_type();
        let name = if action_type.is_cluster_wide() {
            format!("{}-{}", action_type, short_id())
        } else {
            node.name.clone()
        };
        let log_path = log_dir.join(format!("{name}.{action_type}.log"));
        Self {
            name,
            task: task.into(),
            node,
            kind,
            log_path,
            created_at: Utc::now(),
            state: Mutex::new(ActionState {
                status: ActionStatus::Pending,
                error: None,
                started_at: None,
                finished_at: None,
            }),
            items: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the task that owns this action
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> ActionStatus {
        self.state.lock().status
    }

    pub fn error(&self) -> Option<ErrorDetail> {
        self.state.lock().error.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().finished_at
    }

    /// Pending -> Doing. Fails for any other state, so an action runs at most once.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != ActionStatus::Pending {
            return Err(DeployError::internal(format!(
                "action {} already {:?}",
                self.name, state.status
            )));
        }
        state.status = ActionStatus::Doing;
        state.started_at = Some(Utc::now());
        Ok(())
    }

    /// Doing -> Done | Failed
    pub fn finish(&self, result: std::result::Result<(), ErrorDetail>) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != ActionStatus::Doing {
            return Err(DeployError::internal(format!(
                "action {} finished while {:?}",
                self.name, state.status
            )));
        }
        match result {
            Ok(()) => state.status = ActionStatus::Done,
            Err(error) => {
                state.status = ActionStatus::Failed;
                state.error = Some(error);
            }
        }
        state.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn push_item(&self, item: ActionItem) {
        self.items.lock().push(item);
    }

    pub fn items(&self) -> Vec<ActionItem> {
        self.items.lock().clone()
    }

    /// Names of failed items, in report order
    pub fn failed_items(&self) -> Vec<String> {
        self.items
            .lock()
            .iter()
            .filter(|item| item.status == ActionStatus::Failed)
            .map(|item| item.name.clone())
            .collect()
    }

    pub fn record(&self, record: CommandRecord) {
        self.log.lock().push(record);
    }

    pub fn execution_log(&self) -> Vec<CommandRecord> {
        self.log.lock().clone()
    }

    /// Text form of the execution log, as written to `log_path`
    pub fn render_log(&self) -> String {
        let mut out = String::new();
        for record in self.log.lock().iter() {
            record.render(&mut out);
        }
        let state = self.state.lock();
        if let Some(error) = &state.error {
            use std::fmt::Write;
            let _ = writeln!(out, "action failed: {error}");
        }
        out
    }
}

fn short_id() -> String {
    cuid2::create_id().chars().take(8).collect()
}
