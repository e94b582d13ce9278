//! Built-in executors, one per [`ActionType`].

mod cluster;
mod connectivity;
mod etcd;
mod master;
mod node;
mod worker;

use std::sync::Arc;

use super::{Action, ActionType, ExecutorRegistry};
use crate::core::{DeployError, Result};

pub use cluster::{AppendLabelExecutor, DeployConfigExecutor, DeployContourExecutor, FetchKubeConfigExecutor};
pub use connectivity::ConnectivityCheckExecutor;
pub use etcd::DeployEtcdExecutor;
pub use master::{InitMasterExecutor, JoinMasterExecutor};
pub use node::{NodeCheckExecutor, NodeInitExecutor, TestConnectionExecutor};
pub use worker::{DeployIngressExecutor, DeployNodeExecutor, DeployWorkerExecutor};

pub fn register_builtin(registry: &ExecutorRegistry) -> Result<()> {
    registry.register(ActionType::TestConnection, Arc::new(TestConnectionExecutor))?;
    registry.register(ActionType::NodeCheck, Arc::new(NodeCheckExecutor))?;
    registry.register(ActionType::ConnectivityCheck, Arc::new(ConnectivityCheckExecutor))?;
    registry.register(ActionType::NodeInit, Arc::new(NodeInitExecutor))?;
    registry.register(ActionType::DeployEtcd, Arc::new(DeployEtcdExecutor))?;
    registry.register(ActionType::InitMaster, Arc::new(InitMasterExecutor))?;
    registry.register(ActionType::JoinMaster, Arc::new(JoinMasterExecutor))?;
    registry.register(ActionType::DeployWorker, Arc::new(DeployWorkerExecutor))?;
    registry.register(ActionType::DeployNode, Arc::new(DeployNodeExecutor))?;
    registry.register(ActionType::DeployIngress, Arc::new(DeployIngressExecutor))?;
    registry.register(ActionType::DeployContour, Arc::new(DeployContourExecutor))?;
    registry.register(ActionType::DeployConfig, Arc::new(DeployConfigExecutor))?;
    registry.register(ActionType::FetchKubeConfig, Arc::new(FetchKubeConfigExecutor))?;
    registry.register(ActionType::AppendLabel, Arc::new(AppendLabelExecutor))?;
    Ok(())
}

fn mismatch(expected: ActionType, action: &Action) -> DeployError {
    DeployError::type_mismatch(expected.as_str(), action.action_type().as_str())
}

/// Fail with the names of failed items, if any
fn check_items(action: &Action) -> Result<()> {
    let failed = action.failed_items();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(DeployError::items_failed(failed))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;

    use crate::action::{run_action, Action, ActionKind, ExecContext, ExecutorRegistry};
    use crate::core::EngineConfig;
    use crate::machine::ScriptedConnector;
    use crate::model::NodeConfig;

    pub fn ctx(connector: &ScriptedConnector, log_dir: &Path) -> ExecContext {
        let mut config = EngineConfig::development();
        config.log_dir = log_dir.to_path_buf();
        ExecContext::new(Arc::new(connector.clone()), Arc::new(config))
    }

    pub fn node(name: &str, ip: &str) -> NodeConfig {
        NodeConfig::new(name, ip)
    }

    pub async fn run(ctx: &ExecContext, node: NodeConfig, kind: ActionKind) -> Arc<Action> {
        let action = Arc::new(Action::new("test", &ctx.config.log_dir, node, kind));
        let registry = ExecutorRegistry::with_defaults().unwrap();
        run_action(&registry, action.clone(), ctx).await;
        action
    }
}
