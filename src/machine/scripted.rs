//! In-process connector with scripted responses.
//!
//! Used by the test-suite and for dry runs: every command succeeds with empty
//! output unless a rule matching (node, command substring) says otherwise.
//! All calls are recorded on a timeline.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{CommandOutput, ContainerSpec, Machine, MachineConnector};
use crate::model::NodeConfig;

#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub output: CommandOutput,
    pub delay: Duration,
    /// Fail the session itself instead of returning an exit status
    pub transport_error: Option<String>,
}

impl ScriptedResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                exit_code: 0,
                stdout: stdout.into(),
                stderr: String::new(),
            },
            ..Default::default()
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: stderr.into(),
            },
            ..Default::default()
        }
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            transport_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub node: String,
    pub operation: String,
    pub started_at: Instant,
    pub finished_at: Instant,
}

struct Rule {
    node: Option<String>,
    pattern: String,
    response: ScriptedResponse,
}

#[derive(Default)]
struct Inner {
    rules: RwLock<Vec<Rule>>,
    unreachable: RwLock<HashSet<String>>,
    files: DashMap<(String, String), Vec<u8>>,
    timeline: Mutex<Vec<TimelineEntry>>,
}

impl Inner {
    fn lookup(&self, node: &str, command: &str) -> ScriptedResponse {
        let rules = self.rules.read();
        rules
            .iter()
            .rev()
            .find(|rule| {
                rule.node.as_deref().map_or(true, |n| n == node) && command.contains(&rule.pattern)
            })
            .map(|rule| rule.response.clone())
            .unwrap_or_default()
    }

    fn record(&self, node: &str, operation: String, started_at: Instant) {
        self.timeline.lock().push(TimelineEntry {
            node: node.to_string(),
            operation,
            started_at,
            finished_at: Instant::now(),
        });
    }
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<Inner>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern`; later rules take precedence
    pub fn respond(&self, node: Option<&str>, pattern: impl Into<String>, response: ScriptedResponse) {
        self.inner.rules.write().push(Rule {
            node: node.map(str::to_string),
            pattern: pattern.into(),
            response,
        });
    }

    pub fn set_unreachable(&self, node: impl Into<String>) {
        self.inner.unreachable.write().insert(node.into());
    }

    /// Serve `contents` for `fetch_file(path)` on `node`
    pub fn serve_file(&self, node: impl Into<String>, path: impl Into<String>, contents: Vec<u8>) {
        self.inner.files.insert((node.into(), path.into()), contents);
    }

    /// A file previously uploaded with `put_file`
    pub fn uploaded(&self, node: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .files
            .get(&(node.to_string(), path.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.inner.timeline.lock().clone()
    }

    /// Commands run on `node`, in completion order
    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.inner
            .timeline
            .lock()
            .iter()
            .filter(|entry| entry.node == node)
            .map(|entry| entry.operation.clone())
            .collect()
    }
}

#[async_trait]
impl MachineConnector for ScriptedConnector {
    async fn connect(&self, node: &NodeConfig) -> anyhow::Result<Arc<dyn Machine>> {
        if self.inner.unreachable.read().contains(&node.name) {
            return Err(anyhow!("dial tcp {}:{}: connection refused", node.ip, node.ssh.port));
        }
        Ok(Arc::new(ScriptedMachine {
            node: node.name.clone(),
            inner: self.inner.clone(),
        }))
    }
}

struct ScriptedMachine {
    node: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl Machine for ScriptedMachine {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let started_at = Instant::now();
        let response = self.inner.lookup(&self.node, command);
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        self.inner.record(&self.node, command.to_string(), started_at);
        match response.transport_error {
            Some(message) => Err(anyhow!(message)),
            None => Ok(response.output),
        }
    }

    async fn put_file(&self, contents: &[u8], remote_path: &str, _mode: u32) -> anyhow::Result<()> {
        let started_at = Instant::now();
        self.inner
            .files
            .insert((self.node.clone(), remote_path.to_string()), contents.to_vec());
        self.inner.record(&self.node, format!("put {remote_path}"), started_at);
        Ok(())
    }

    async fn fetch_file(&self, remote_path: &str) -> anyhow::Result<Vec<u8>> {
        let started_at = Instant::now();
        let contents = self
            .inner
            .files
            .get(&(self.node.clone(), remote_path.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("{remote_path}: no such file"));
        self.inner.record(&self.node, format!("fetch {remote_path}"), started_at);
        contents
    }

    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let operation = format!("docker run {} {}", spec.name, spec.image);
        let output = self.run_command(&operation).await?;
        if !output.success() {
            return Err(anyhow!("docker: {}", output.stderr));
        }
        Ok(format!("{}-{}", spec.name, cuid2::create_id()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_default_response() {
        let connector = ScriptedConnector::new();
        connector.respond(None, "nproc", ScriptedResponse::ok("4"));
        connector.respond(Some("n2"), "nproc", ScriptedResponse::ok("1"));

        let n1 = connector.connect(&NodeConfig::new("n1", "10.0.0.1")).await.unwrap();
        let n2 = connector.connect(&NodeConfig::new("n2", "10.0.0.2")).await.unwrap();

        assert_eq!(n1.run_command("nproc").await.unwrap().stdout, "4");
        assert_eq!(n2.run_command("nproc").await.unwrap().stdout, "1");
        assert!(n1.run_command("uname -r").await.unwrap().success());
        assert_eq!(connector.commands_on("n1"), vec!["nproc", "uname -r"]);
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let connector = ScriptedConnector::new();
        connector.set_unreachable("n1");
        assert!(connector.connect(&NodeConfig::new("n1", "10.0.0.1")).await.is_err());
    }

    #[tokio::test]
    async fn test_files_round_trip_per_node() {
        let connector = ScriptedConnector::new();
        let n1 = connector.connect(&NodeConfig::new("n1", "10.0.0.1")).await.unwrap();
        n1.put_file(b"data", "/etc/x", 0o600).await.unwrap();
        assert_eq!(connector.uploaded("n1", "/etc/x").unwrap(), b"data");
        assert!(connector.uploaded("n2", "/etc/x").is_none());
    }
}
