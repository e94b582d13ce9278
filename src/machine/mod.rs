//! Remote machine access consumed by executors.
//!
//! The SSH and Docker plumbing behind these traits lives outside this crate;
//! executors only see [`MachineConnector`] and [`Machine`]. Errors at this
//! boundary are plain `anyhow` errors and get classified by the caller.

pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::NodeConfig;

pub use scripted::{ScriptedConnector, ScriptedResponse, TimelineEntry};

/// Result of one remote command session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A container started through the node's Docker daemon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// host path -> container path
    pub mounts: BTreeMap<String, String>,
    pub host_network: bool,
    pub restart_always: bool,
}

/// An open connection to one node
#[async_trait]
pub trait Machine: Send + Sync {
    fn node_name(&self) -> &str;

    /// Run a command in a fresh session and wait for it to exit
    async fn run_command(&self, command: &str) -> anyhow::Result<CommandOutput>;

    async fn put_file(&self, contents: &[u8], remote_path: &str, mode: u32) -> anyhow::Result<()>;

    async fn fetch_file(&self, remote_path: &str) -> anyhow::Result<Vec<u8>>;

    /// Create and start a container, returning its id
    async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MachineConnector: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> anyhow::Result<Arc<dyn Machine>>;
}
