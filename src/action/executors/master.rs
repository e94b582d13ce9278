use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

use super::{check_items, mismatch, worker::join};
use crate::action::{Action, ActionItem, ActionKind, ActionType, ExecContext, Executor, ItemErrorKind, RemoteSession};
use crate::core::{DeployError, Result};
use crate::scripts::{self, ADMIN_KUBECONFIG, ETCD_PKI_DIR, FLANNEL_MANIFEST, KUBEADM_CONFIG, MASTER_ETCD_PKI_DIR};

const ETCD_CLIENT_FILES: [(&str, u32); 3] = [
    ("ca.crt", 0o644),
    ("apiserver-etcd-client.crt", 0o644),
    ("apiserver-etcd-client.key", 0o600),
];

/// Bootstrap the control plane on the first master.
///
/// Each phase is reported as an item; a failed phase stops the rest.
pub struct InitMasterExecutor;

impl InitMasterExecutor {
    fn phase<T>(action: &Action, name: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                action.push_item(ActionItem::done(name));
                Ok(value)
            }
            Err(e) => {
                action.push_item(ActionItem::failed(name, ItemErrorKind::Script, e.detail()));
                Err(DeployError::items_failed([name]))
            }
        }
    }

    /// Fetch the etcd client credentials from one etcd member, concurrently
    async fn fetch_etcd_client(action: &Arc<Action>, etcd: &RemoteSession) -> Vec<(&'static str, u32, Vec<u8>)> {
        let fetched = join_all(ETCD_CLIENT_FILES.iter().map(|&(file, mode)| {
            let etcd = etcd.clone();
            let action = action.clone();
            async move {
                let item = format!("fetch {file}");
                match etcd.fetch_file(&format!("{ETCD_PKI_DIR}/{file}")).await {
                    Ok(bytes) => {
                        action.push_item(ActionItem::done(item));
                        Some((file, mode, bytes))
                    }
                    Err(e) => {
                        action.push_item(ActionItem::failed(item, ItemErrorKind::Script, e.detail()));
                        None
                    }
                }
            }
        }))
        .await;
        fetched.into_iter().flatten().collect()
    }
}

#[async_trait]
impl Executor for InitMasterExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::InitMaster {
            cluster,
            etcd_nodes,
            masters,
        } = action.kind()
        else {
            return Err(mismatch(ActionType::InitMaster, action));
        };
        let first_etcd = etcd_nodes.first().ok_or_else(|| DeployError::empty_nodes("etcd"))?;
        let master = action.node();

        let etcd = RemoteSession::open(action, first_etcd, ctx).await?;
        let files = Self::fetch_etcd_client(action, &etcd).await;
        etcd.close().await;
        check_items(action)?;

        let session = RemoteSession::open(action, master, ctx).await?;
        let result: Result<()> = async {
            Self::phase(action, "upload etcd client certs", async {
                session.run(&format!("mkdir -p {MASTER_ETCD_PKI_DIR}")).await?;
                for (file, mode, bytes) in &files {
                    session
                        .put_file(bytes, &format!("{MASTER_ETCD_PKI_DIR}/{file}"), *mode)
                        .await?;
                }
                Ok::<(), DeployError>(())
            }
            .await)?;

            let config = Self::phase(
                action,
                "kubeadm config",
                scripts::kubeadm_init_config(cluster, master, masters, etcd_nodes),
            )?;
            Self::phase(
                action,
                "write kubeadm config",
                session.put_file(config.as_bytes(), KUBEADM_CONFIG, 0o600).await,
            )?;

            let initialized = session
                .run_unchecked(&format!("test -f {ADMIN_KUBECONFIG}"))
                .await?
                .success();
            if initialized {
                info!(node = %master.name, "control plane already initialized");
                action.push_item(ActionItem::done("kubeadm init"));
            } else {
                Self::phase(action, "kubeadm init", session.run(&scripts::kubeadm_init()).await)?;
            }

            Self::phase(
                action,
                "apply network",
                session
                    .run(&scripts::kubectl(&format!("apply -f {FLANNEL_MANIFEST}")))
                    .await,
            )?;
            Self::phase(
                action,
                "verify",
                session.run(&scripts::kubectl("get nodes")).await,
            )?;
            Ok(())
        }
        .await;
        session.close().await;
        result
    }
}

/// Join an additional control-plane node
pub struct JoinMasterExecutor;

#[async_trait]
impl Executor for JoinMasterExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::JoinMaster { cluster, first_master } = action.kind() else {
            return Err(mismatch(ActionType::JoinMaster, action));
        };
        let session = RemoteSession::open(action, action.node(), ctx).await?;
        let result = join(&session, cluster, first_master, true).await;
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
    use crate::model::{ClusterConfig, NodeConfig};

    fn kind(etcd: Vec<NodeConfig>, masters: Vec<NodeConfig>) -> ActionKind {
        let mut cluster = ClusterConfig::new("c");
        cluster.ensure_join_secrets();
        ActionKind::InitMaster {
            cluster: Arc::new(cluster),
            etcd_nodes: Arc::new(etcd),
            masters: Arc::new(masters),
        }
    }

    fn serve_etcd_files(connector: &ScriptedConnector, node: &str) {
        for (file, _) in ETCD_CLIENT_FILES {
            connector.serve_file(node, format!("{ETCD_PKI_DIR}/{file}"), file.as_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_init_copies_etcd_client_and_inits() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        serve_etcd_files(&connector, "e1");
        connector.respond(Some("m1"), "test -f", ScriptedResponse::exit(1, ""));
        let ctx = ctx(&connector, dir.path());
        let m1 = node("m1", "10.0.0.1");

        let action = run(&ctx, m1.clone(), kind(vec![node("e1", "10.0.1.1")], vec![m1])).await;
        assert_eq!(action.status(), ActionStatus::Done, "{:?}", action.error());
        assert_eq!(
            connector.uploaded("m1", "/etc/kubernetes/pki/etcd/apiserver-etcd-client.key"),
            Some(b"apiserver-etcd-client.key".to_vec())
        );
        assert!(connector.uploaded("m1", KUBEADM_CONFIG).is_some());
        assert!(connector.commands_on("m1").iter().any(|c| c.starts_with("kubeadm init")));
        assert!(action.items().iter().all(|item| item.status == ActionStatus::Done));
    }

    #[tokio::test]
    async fn test_missing_etcd_file_reports_item() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.serve_file("e1", format!("{ETCD_PKI_DIR}/ca.crt"), b"ca".to_vec());
        let ctx = ctx(&connector, dir.path());
        let m1 = node("m1", "10.0.0.1");

        let action = run(&ctx, m1.clone(), kind(vec![node("e1", "10.0.1.1")], vec![m1])).await;
        assert_eq!(action.status(), ActionStatus::Failed);
        let mut failed = action.failed_items();
        failed.sort();
        assert_eq!(
            failed,
            vec![
                "fetch apiserver-etcd-client.crt".to_string(),
                "fetch apiserver-etcd-client.key".to_string()
            ]
        );
        assert!(connector.commands_on("m1").is_empty());
    }

    #[tokio::test]
    async fn test_join_master_uses_control_plane_flags() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new();
        connector.respond(None, "test -f", ScriptedResponse::exit(1, ""));
        let ctx = ctx(&connector, dir.path());
        let mut cluster = ClusterConfig::new("c");
        cluster.ensure_join_secrets();

        let action = run(
            &ctx,
            node("m2", "10.0.0.2"),
            ActionKind::JoinMaster {
                cluster: Arc::new(cluster),
                first_master: node("m1", "10.0.0.1"),
            },
        )
        .await;
        assert_eq!(action.status(), ActionStatus::Done);
        assert!(connector
            .commands_on("m2")
            .iter()
            .any(|c| c.contains("--control-plane --certificate-key")));
    }
}
