//! Built-in processors, one per [`TaskType`].

mod deploy;
mod etcd;
mod nodes;

use std::sync::Arc;

use super::{ProcessorRegistry, Task, TaskType};
use crate::action::{Action, ActionKind};
use crate::core::{DeployError, Result};
use crate::model::NodeConfig;

pub use deploy::{
    DeployConfigProcessor, DeployMasterProcessor, DeployProcessor, InitMasterProcessor, JoinMasterProcessor,
    NodeInitProcessor, PRIORITY_CONFIG, PRIORITY_ETCD, PRIORITY_INGRESS, PRIORITY_INIT, PRIORITY_INIT_MASTER,
    PRIORITY_JOIN_MASTER, PRIORITY_MASTER, PRIORITY_WORKER,
};
pub use etcd::DeployEtcdProcessor;
pub use nodes::{
    AppendLabelProcessor, ConnectivityCheckProcessor, DeployIngressProcessor, DeployNodeProcessor,
    DeployWorkerProcessor, FetchKubeConfigProcessor, NodeCheckProcessor, TestConnectionProcessor,
};

pub fn register_builtin(registry: &ProcessorRegistry) -> Result<()> {
    registry.register(TaskType::Deploy, Arc::new(DeployProcessor))?;
    registry.register(TaskType::NodeInit, Arc::new(NodeInitProcessor))?;
    registry.register(TaskType::DeployEtcd, Arc::new(DeployEtcdProcessor))?;
    registry.register(TaskType::DeployMaster, Arc::new(DeployMasterProcessor))?;
    registry.register(TaskType::InitMaster, Arc::new(InitMasterProcessor))?;
    registry.register(TaskType::JoinMaster, Arc::new(JoinMasterProcessor))?;
    registry.register(TaskType::DeployConfig, Arc::new(DeployConfigProcessor))?;
    registry.register(TaskType::DeployWorker, Arc::new(DeployWorkerProcessor))?;
    registry.register(TaskType::DeployIngress, Arc::new(DeployIngressProcessor))?;
    registry.register(TaskType::DeployNode, Arc::new(DeployNodeProcessor))?;
    registry.register(TaskType::NodeCheck, Arc::new(NodeCheckProcessor))?;
    registry.register(TaskType::ConnectivityCheck, Arc::new(ConnectivityCheckProcessor))?;
    registry.register(TaskType::TestConnection, Arc::new(TestConnectionProcessor))?;
    registry.register(TaskType::FetchKubeConfig, Arc::new(FetchKubeConfigProcessor))?;
    registry.register(TaskType::AppendLabel, Arc::new(AppendLabelProcessor))?;
    Ok(())
}

fn mismatch(expected: TaskType, task: &Task) -> DeployError {
    DeployError::type_mismatch(expected.as_str(), task.task_type().as_str())
}

fn action(task: &Task, node: &NodeConfig, kind: ActionKind) -> Arc<Action> {
    Arc::new(Action::new(task.name(), task.log_dir(), node.clone(), kind))
}

/// One action per node, `role` names the nodes in the empty-list error
fn per_node(task: &Task, nodes: &[NodeConfig], role: &str, kind: impl Fn(&NodeConfig) -> ActionKind) -> Result<Vec<Arc<Action>>> {
    if nodes.is_empty() {
        return Err(DeployError::empty_nodes(role));
    }
    Ok(nodes.iter().map(|node| action(task, node, kind(node))).collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::certs::RcgenIssuer;
    use crate::core::EngineConfig;
    use crate::model::{NodeConfig, Role};
    use crate::task::SplitContext;

    pub fn split_ctx() -> SplitContext {
        SplitContext::new(Arc::new(RcgenIssuer), Arc::new(EngineConfig::development()))
    }

    pub fn node(name: &str, ip: &str, roles: &[Role]) -> NodeConfig {
        NodeConfig::new(name, ip).with_roles(roles.iter().copied())
    }
}
