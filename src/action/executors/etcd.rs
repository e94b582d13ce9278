use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::mismatch;
use crate::action::{Action, ActionKind, ActionType, ExecContext, Executor, RemoteSession};
use crate::core::{DeployError, Result};
use crate::machine::ContainerSpec;
use crate::model::NodeConfig;
use crate::scripts::{self, ETCD_DATA_DIR, ETCD_PKI_DIR};

/// Upload certificates, start the etcd container and wait until it is healthy
pub struct DeployEtcdExecutor;

impl DeployEtcdExecutor {
    /// Poll health with `initial << retry` backoff; the final poll happens at the deadline
    async fn wait_ready(session: &RemoteSession, node: &NodeConfig, ctx: &ExecContext) -> Result<()> {
        let deadline = ctx.config.etcd_ready_deadline;
        let give_up = Instant::now() + deadline;
        let health = scripts::etcd_health(node);
        let mut retry: u32 = 0;
        loop {
            match session.run(&health).await {
                Ok(_) => {
                    info!(node = %node.name, retries = retry, "etcd ready");
                    return Ok(());
                }
                Err(e @ DeployError::Cancelled { .. }) => return Err(e),
                Err(e) => debug!(node = %node.name, retry, error = %e, "etcd not ready"),
            }
            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeployError::timeout(
                    format!("etcd on {} to become ready", node.name),
                    deadline.as_millis() as u64,
                ));
            }
            // The last sleep is shortened so one poll lands on the deadline
            let wait = backoff(ctx.config.etcd_ready_initial_backoff, retry).min(remaining);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(DeployError::cancelled(format!("waiting for etcd on {}", node.name)));
                }
                _ = sleep(wait) => {}
            }
            retry += 1;
        }
    }
}

#[async_trait]
impl Executor for DeployEtcdExecutor {
    async fn execute(&self, action: &Arc<Action>, ctx: &ExecContext) -> Result<()> {
        let ActionKind::DeployEtcd {
            cluster,
            peers,
            ca,
            client,
            server,
            peer,
        } = action.kind()
        else {
            return Err(mismatch(ActionType::DeployEtcd, action));
        };
        let node = action.node();
        let session = RemoteSession::open(action, node, ctx).await?;

        let result: Result<()> = async {
            session.run(&format!("mkdir -p {ETCD_PKI_DIR} {ETCD_DATA_DIR}")).await?;
            let files: [(&str, &str, u32); 8] = [
                ("ca.crt", &ca.cert_pem, 0o644),
                ("ca.key", &ca.key_pem, 0o600),
                ("server.crt", &server.cert_pem, 0o644),
                ("server.key", &server.key_pem, 0o600),
                ("peer.crt", &peer.cert_pem, 0o644),
                ("peer.key", &peer.key_pem, 0o600),
                ("apiserver-etcd-client.crt", &client.cert_pem, 0o644),
                ("apiserver-etcd-client.key", &client.key_pem, 0o600),
            ];
            for (file, contents, mode) in files {
                session
                    .put_file(contents.as_bytes(), &format!("{ETCD_PKI_DIR}/{file}"), mode)
                    .await?;
            }

            session.run_unchecked("docker rm -f etcd").await?;
            let spec = ContainerSpec {
                name: "etcd".to_string(),
                image: format!("{}/etcd:{}-0", cluster.image_repository, cluster.etcd_version),
                args: scripts::etcd_args(node, peers, cluster),
                env: BTreeMap::new(),
                mounts: BTreeMap::from([
                    (ETCD_PKI_DIR.to_string(), ETCD_PKI_DIR.to_string()),
                    (ETCD_DATA_DIR.to_string(), ETCD_DATA_DIR.to_string()),
                ]),
                host_network: true,
                restart_always: true,
            };
            let id = session.start_container(&spec).await?;
            debug!(node = %node.name, container = %id, "etcd container started");

            Self::wait_ready(&session, node, ctx).await
        }
        .await;
        session.close().await;
        result
    }
}

fn backoff(initial: Duration, retry: u32) -> Duration {
    initial.saturating_mul(1u32 << retry.min(16))
}
