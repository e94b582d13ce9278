//! Nodes and cluster settings shared by tasks and actions. The core reads
//! these but never mutates a node's identity.

pub mod cluster;
pub mod node;

pub use cluster::{ApiServerEndpoint, ClusterConfig};
pub use node::{NodeConfig, Role, SshCredentials};
