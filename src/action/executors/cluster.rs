use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::mismatch;
use crate::action::{Action, ActionKind, ActionType, ExecContext, Executor, RemoteSession};
use crate::core::{DeployError, Result};
use crate::scripts::{self, ADDON_DIR, ADMIN_KUBECONFIG, CONTOUR_MANIFEST};

/// Install the Contour ingress controller from the first master
pub struct DeployContourExecutor;

#[async_trait]
impl Executor for DeployContourExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployContour { .. } = action.kind() else {
            return Err(mismatch(ActionType::DeployContour, action));
        };
        let session = RemoteSession::open(action, action.node(), ctx).await?;
        let result: Result<()> = async {
            session
                .run(&scripts::kubectl(&format!("apply -f {CONTOUR_MANIFEST}")))
                .await?;
            session
                .run(&scripts::kubectl(
                    "-n projectcontour rollout status deployment/contour --timeout=300s",
                ))
                .await?;
            Ok(())
        }
        .await;
        session.close().await;
        result
    }
}

/// Apply cluster-level add-on manifests
pub struct DeployConfigExecutor;

#[async_trait]
impl Executor for DeployConfigExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployConfig { cluster } = action.kind() else {
            return Err(mismatch(ActionType::DeployConfig, action));
        };
        let manifest = scripts::cluster_settings_manifest(cluster);
        let path = format!("{ADDON_DIR}/cluster-settings.yaml");

        let session = RemoteSession::open(action, action.node(), ctx).await?;
        let result: Result<()> = async {
            session.run(&format!("mkdir -p {ADDON_DIR}")).await?;
            session.put_file(manifest.as_bytes(), &path, 0o644).await?;
            session.run(&scripts::kubectl(&format!("apply -f {path}"))).await?;
            Ok(())
        }
        .await;
        session.close().await;
        result
    }
}

/// Copy the admin kubeconfig from a master to a local path
pub struct FetchKubeConfigExecutor;

#[async_trait]
impl Executor for FetchKubeConfigExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::FetchKubeConfig { destination } = action.kind() else {
            return Err(mismatch(ActionType::FetchKubeConfig, action));
        };
        let session = RemoteSession::open(action, action.node(), ctx).await?;
        let fetched = session.fetch_file(ADMIN_KUBECONFIG).await;
        session.close().await;
        let contents = fetched?;

        if let Some(dir) = destination.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DeployError::io(format!("create {}", dir.display()), e))?;
        }
        tokio::fs::write(destination, &contents)
            .await
            .map_err(|e| DeployError::io(format!("write {}", destination.display()), e))?;
        info!(from = %action.node().name, to = %destination.display(), "kubeconfig saved");
        Ok(())
    }
}

pub struct AppendLabelExecutor;

#[async_trait]
impl Executor for AppendLabelExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::AppendLabel { master, labels } = action.kind() else {
            return Err(mismatch(ActionType::AppendLabel, action));
        };
        let command = scripts::label_node(&action.node().name, labels)?;
        let session = RemoteSession::open(action, master, ctx).await?;
        let result = session.run(&command).await.map(|_| ());
        session.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{ctx, node, run};
    use super::*;
    use crate::action::ActionStatus;
    use crate::machine::{ScriptedConnector, ScriptedResponse};
    use crate::model::ClusterConfig;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_fetch_kubeconfig_writes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.serve_file("m1", ADMIN_KUBECONFIG, b"apiVersion: v1\n".to_vec());
        let ctx = ctx(&connector, dir.path());
        let destination = dir.path().join("out").join("admin.conf");

        let action = run(
            &ctx,
            node("m1", "10.0.0.1"),
            ActionKind::FetchKubeConfig {
                destination: destination.clone(),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        assert!(action.name().starts_with("fetch-kubeconfig-"));
        assert_eq!(std::fs::read_to_string(destination).unwrap(), "apiVersion: v1\n");
    }

    #[tokio::test]
    async fn test_deploy_config_applies_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let ctx = ctx(&connector, dir.path());

        let action = run(
            &ctx,
            node("m1", "10.0.0.1"),
            ActionKind::DeployConfig {
                cluster: Arc::new(ClusterConfig::new("prod")),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        let manifest = connector
            .uploaded("m1", "/etc/kubernetes/addons/cluster-settings.yaml")
            .unwrap();
        assert!(String::from_utf8(manifest).unwrap().contains("clusterName: \"prod\""));
    }

    #[tokio::test]
    async fn test_contour_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.respond(None, "contour.yaml", ScriptedResponse::exit(1, "unable to recognize"));
        let ctx = ctx(&connector, dir.path());

        let action = run(
            &ctx,
            node("m1", "10.0.0.1"),
            ActionKind::DeployContour {
                cluster: Arc::new(ClusterConfig::new("c")),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Failed);
        let error = action.error().unwrap();
        assert_eq!(error.reason, "command failed");
        assert!(error.detail.contains("unable to recognize"));
    }

    #[tokio::test]
    async fn test_append_label_runs_on_master() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        let ctx = ctx(&connector, dir.path());

        let action = run(
            &ctx,
            node("w1", "10.0.2.1"),
            ActionKind::AppendLabel {
                master: node("m1", "10.0.0.1"),
                labels: BTreeMap::new(),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Failed);
        assert!(connector.commands_on("m1").is_empty());

        let labels = BTreeMap::from([("zone".to_string(), "b".to_string())]);
        let action = run(
            &ctx,
            node("w1", "10.0.2.1"),
            ActionKind::AppendLabel {
                master: node("m1", "10.0.0.1"),
                labels,
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        assert!(connector.commands_on("w1").is_empty());
        assert!(connector.commands_on("m1")[0].ends_with("label node w1 --overwrite zone=b"));
    }
}
