use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

use super::{check_items, mismatch};
use crate::action::{Action, ActionItem, ActionKind, ActionType, ExecContext, Executor, ItemErrorKind, RemoteSession};
use crate::core::{DeployError, ErrorDetail, Result};
use crate::scripts;

/// Connect and run a trivial command
pub struct TestConnectionExecutor;

#[async_trait]
impl Executor for TestConnectionExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::TestConnection = action.kind() else {
            return Err(mismatch(ActionType::TestConnection, action));
        };
        let session = RemoteSession::open(action, action.node(), ctx).await?;
        let result = session.run(scripts::hostname()).await;
        session.close().await;
        result.map(|output| {
            debug!(node = %action.node().name, hostname = %output.stdout.trim(), "connection ok");
        })
    }
}

/// Hardware and OS requirements, one item per check
pub struct NodeCheckExecutor;

impl NodeCheckExecutor {
    async fn numeric(session: &RemoteSession, command: &str) -> std::result::Result<u64, (ItemErrorKind, ErrorDetail)> {
        let output = session
            .run(command)
            .await
            .map_err(|e| (ItemErrorKind::Script, e.detail()))?;
        output.stdout.trim().parse::<u64>().map_err(|e| {
            (
                ItemErrorKind::Script,
                ErrorDetail::new(
                    "unexpected output",
                    format!("`{command}` printed {:?}: {e}", output.stdout.trim()),
                    "check that the node runs a supported Linux distribution",
                ),
            )
        })
    }

    fn below(name: &str, actual: u64, required: u64, unit: &str) -> (ItemErrorKind, ErrorDetail) {
        (
            ItemErrorKind::Script,
            ErrorDetail::new(
                "requirement not met",
                format!("{name}: {actual}{unit} available, {required}{unit} required"),
                "use a larger machine for this node",
            ),
        )
    }
}

#[async_trait]
impl Executor for NodeCheckExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::NodeCheck { requirements } = action.kind() else {
            return Err(mismatch(ActionType::NodeCheck, action));
        };
        let session = RemoteSession::open(action, action.node(), ctx).await?;

        let cpu = Self::numeric(&session, scripts::cpu_count())
            .await
            .and_then(|cpu| {
                if cpu < requirements.min_cpu as u64 {
                    Err(Self::below("cpu", cpu, requirements.min_cpu as u64, ""))
                } else {
                    Ok(())
                }
            });
        let memory = Self::numeric(&session, scripts::memory_mb())
            .await
            .and_then(|mb| {
                if mb < requirements.min_memory_mb {
                    Err(Self::below("memory", mb, requirements.min_memory_mb, "MiB"))
                } else {
                    Ok(())
                }
            });
        let os = session
            .run(scripts::os_release())
            .await
            .map(|_| ())
            .map_err(|e| (ItemErrorKind::Script, e.detail()));
        let runtime = session
            .run(scripts::container_runtime())
            .await
            .map(|_| ())
            .map_err(|e| (ItemErrorKind::Script, e.detail()));
        session.close().await;

        for (name, result) in [("cpu", cpu), ("memory", memory), ("os", os), ("container-runtime", runtime)] {
            match result {
                Ok(()) => action.push_item(ActionItem::done(name)),
                Err((kind, error)) => action.push_item(ActionItem::failed(name, kind, error)),
            }
        }
        check_items(action)
    }
}

/// Prepare a node for kubeadm; init steps run concurrently
pub struct NodeInitExecutor;

#[async_trait]
impl Executor for NodeInitExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::NodeInit { .. } = action.kind() else {
            return Err(mismatch(ActionType::NodeInit, action));
        };
        let steps = scripts::node_init_steps(action.node());
        if steps.is_empty() {
            return Err(DeployError::internal("no init steps"));
        }
        let session = RemoteSession::open(action, action.node(), ctx).await?;
        join_all(steps.into_iter().map(|(name, command)| {
            let session = session.clone();
            let action = action.clone();
            async move {
                match session.run(&command).await {
                    Ok(_) => action.push_item(ActionItem::done(name)),
                    Err(e) => action.push_item(ActionItem::failed(name, ItemErrorKind::Script, e.detail())),
                }
            }
        }))
        .await;
        session.close().await;

        check_items(action)
    }
}
