use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::mismatch;
use crate::action::{Action, ActionKind, ActionType, ExecContext, Executor, RemoteSession};
use crate::core::Result;
use crate::model::{ClusterConfig, NodeConfig, Role};
use crate::scripts;

/// Run `kubeadm join` unless the node already has a kubelet config
pub(super) async fn join(
    session: &RemoteSession,
    cluster: &ClusterConfig,
    first_master: &NodeConfig,
    control_plane: bool,
) -> Result<()> {
    if session.run_unchecked(&scripts::already_joined()).await?.success() {
        info!(node = %session.node(), "already joined, skipping");
        return Ok(());
    }
    let command = scripts::kubeadm_join(cluster, first_master, control_plane)?;
    session.run(&command).await?;
    Ok(())
}

async fn join_worker(action: &Arc<Action>, ctx: &ExecContext, cluster: &ClusterConfig, first_master: &NodeConfig) -> Result<()> {
    let session = RemoteSession::open(action, action.node(), ctx).await?;
    let result = join(&session, cluster, first_master, false).await;
    session.close().await;
    result
}

pub struct DeployWorkerExecutor;

#[async_trait]
impl Executor for DeployWorkerExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployWorker { cluster, first_master } = action.kind() else {
            return Err(mismatch(ActionType::DeployWorker, action));
        };
        join_worker(action, ctx, cluster, first_master).await
    }
}

/// Worker join for nodes added to a running cluster
pub struct DeployNodeExecutor;

#[async_trait]
impl Executor for DeployNodeExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployNode { cluster, first_master } = action.kind() else {
            return Err(mismatch(ActionType::DeployNode, action));
        };
        join_worker(action, ctx, cluster, first_master).await
    }
}

/// Join as a worker, then label the node for ingress through the first master
pub struct DeployIngressExecutor;

#[async_trait]
impl Executor for DeployIngressExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployIngress { cluster, first_master } = action.kind() else {
            return Err(mismatch(ActionType::DeployIngress, action));
        };
        if !action.node().has_role(Role::Worker) {
            join_worker(action, ctx, cluster, first_master).await?;
        }

        let master = RemoteSession::open(action, first_master, ctx).await?;
        let labels = BTreeMap::from([("node-role.kubernetes.io/ingress".to_string(), String::new())]);
        let result = match scripts::label_node(&action.node().name, &labels) {
            Ok(command) => master.run(&command).await.map(|_| ()),
            Err(e) => Err(e),
        };
        master.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ctx, node, run};
    use super::*;
    use crate::action::ActionStatus;
    use crate::machine::{ScriptedConnector, ScriptedResponse};

    fn cluster() -> Arc<ClusterConfig> {
        let mut cluster = ClusterConfig::new("c");
        cluster.ensure_join_secrets();
        Arc::new(cluster)
    }

    #[tokio::test]
    async fn test_worker_join_skips_joined_node() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let ctx = ctx(&connector, dir.path());

        let action = run(
            &ctx,
            node("w1", "10.0.2.1"),
            ActionKind::DeployWorker {
                cluster: cluster(),
                first_master: node("m1", "10.0.0.1"),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        assert!(!connector.commands_on("w1").iter().any(|c| c.starts_with("kubeadm join")));
    }

    #[tokio::test]
    async fn test_worker_join_runs_kubeadm() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.respond(None, "test -f", ScriptedResponse::exit(1, ""));
        let ctx = ctx(&connector, dir.path());

        let action = run(
            &ctx,
            node("w1", "10.0.2.1"),
            ActionKind::DeployNode {
                cluster: cluster(),
                first_master: node("m1", "10.0.0.1"),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        let joins: Vec<_> = connector
            .commands_on("w1")
            .into_iter()
            .filter(|c| c.starts_with("kubeadm join 10.0.0.1:6443"))
            .collect();
        assert_eq!(joins.len(), 1);
        assert!(!joins[0].contains("--control-plane"));
    }

    #[tokio::test]
    async fn test_ingress_labels_through_master() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let ctx = ctx(&connector, dir.path());
        let i1 = node("i1", "10.0.3.1").with_roles([Role::Worker, Role::Ingress]);

        let action = run(
            &ctx,
            i1,
            ActionKind::DeployIngress {
                cluster: cluster(),
                first_master: node("m1", "10.0.0.1"),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        assert!(connector.commands_on("i1").is_empty());
        assert!(connector
            .commands_on("m1")
            .iter()
            .any(|c| c.contains("label node i1 --overwrite node-role.kubernetes.io/ingress=")));
    }
}
