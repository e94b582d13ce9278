use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Action, CommandRecord};
use crate::core::{DeployError, Result};
use crate::machine::{CommandOutput, ContainerSpec, Machine};
use crate::model::NodeConfig;

use super::executor::ExecContext;

/// A connection to one node, bound to the action whose log it writes.
///
/// Every operation is raced against the cancellation token and appended to
/// the action's execution log.
#[derive(Clone)]
pub struct RemoteSession {
    action: Arc<Action>,
    machine: Arc<dyn Machine>,
    node: String,
    cancel: CancellationToken,
}

impl RemoteSession {
    pub async fn open(action: &Arc<Action>, node: &NodeConfig, ctx: &ExecContext) -> Result<Self> {
        let started_at = Utc::now();
        let connect = ctx.connector.connect(node);
        let machine = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(DeployError::cancelled(format!("connect {}", node.name)));
            }
            res = connect => res,
        };
        match machine {
            Ok(machine) => {
                debug!(action = %action.name(), node = %node.name, "connected");
                Ok(Self {
                    action: action.clone(),
                    machine,
                    node: node.name.clone(),
                    cancel: ctx.cancel.clone(),
                })
            }
            Err(e) => {
                action.record(CommandRecord {
                    command: format!("connect {}@{}:{}", node.ssh.user, node.ip, node.ssh.port),
                    started_at,
                    finished_at: Utc::now(),
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(e.to_string()),
                });
                Err(DeployError::connection(&node.name, e.to_string()))
            }
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    async fn guarded<T, F>(&self, operation: &str, fut: F) -> Result<anyhow::Result<T>>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeployError::cancelled(format!("{}: {}", self.node, operation))),
            res = fut => Ok(res),
        }
    }

    /// Run a command; a transport error or non-zero exit is an error
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run_unchecked(command).await?;
        if !output.success() {
            return Err(DeployError::Remote {
                node: self.node.clone(),
                message: format!("`{}` exited with {}", command, output.exit_code),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Run a command; only a transport error is an error
    pub async fn run_unchecked(&self, command: &str) -> Result<CommandOutput> {
        let started_at = Utc::now();
        let result = self.guarded(command, self.machine.run_command(command)).await;
        let (stdout, stderr, error) = match &result {
            Ok(Ok(output)) => (
                output.stdout.clone(),
                output.stderr.clone(),
                (!output.success()).then(|| format!("exit status {}", output.exit_code)),
            ),
            Ok(Err(e)) => (String::new(), String::new(), Some(e.to_string())),
            Err(e) => (String::new(), String::new(), Some(e.to_string())),
        };
        self.action.record(CommandRecord {
            command: command.to_string(),
            started_at,
            finished_at: Utc::now(),
            stdout,
            stderr,
            error,
        });
        result?.map_err(|e| DeployError::remote(&self.node, e.to_string()))
    }

    pub async fn put_file(&self, contents: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let operation = format!("put {remote_path} ({} bytes, mode {mode:o})", contents.len());
        let started_at = Utc::now();
        let result = self
            .guarded(&operation, self.machine.put_file(contents, remote_path, mode))
            .await;
        self.record_simple(operation, started_at, &result);
        result?.map_err(|e| DeployError::remote(&self.node, format!("put {remote_path}: {e}")))
    }

    pub async fn fetch_file(&self, remote_path: &str) -> Result<Vec<u8>> {
        let operation = format!("fetch {remote_path}");
        let started_at = Utc::now();
        let result = self.guarded(&operation, self.machine.fetch_file(remote_path)).await;
        self.record_simple(operation, started_at, &result);
        result?.map_err(|e| DeployError::remote(&self.node, format!("fetch {remote_path}: {e}")))
    }

    pub async fn start_container(&self, spec: &ContainerSpec) -> Result<String> {
        let operation = format!("docker run --name {} {}", spec.name, spec.image);
        let started_at = Utc::now();
        let result = self.guarded(&operation, self.machine.start_container(spec)).await;
        self.record_simple(operation, started_at, &result);
        result?.map_err(|e| DeployError::remote(&self.node, format!("container {}: {e}", spec.name)))
    }

    pub async fn close(&self) {
        if let Err(e) = self.machine.close().await {
            debug!(node = %self.node, error = %e, "closing session failed");
        }
    }

    fn record_simple<T>(
        &self,
        command: String,
        started_at: chrono::DateTime<Utc>,
        result: &Result<anyhow::Result<T>>,
    ) {
        let error = match result {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        self.action.record(CommandRecord {
            command,
            started_at,
            finished_at: Utc::now(),
            stdout: String::new(),
            stderr: String::new(),
            error,
        });
    }
}
