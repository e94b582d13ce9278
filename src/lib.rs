//! Kubernetes cluster deployment over SSH.
//!
//! A request becomes a root [`Task`]. The [`Driver`] splits tasks into
//! prioritized sub-tasks or into per-node [`Action`]s, runs sub-tasks of
//! equal priority concurrently and bands of increasing priority in order,
//! and rolls child outcomes up into the parent.

pub mod action;
pub mod certs;
pub mod controller;
pub mod core;
pub mod driver;
pub mod machine;
pub mod model;
pub mod scripts;
pub mod store;
pub mod task;

pub use action::{Action, ActionItem, ActionKind, ActionStatus, ActionType, ExecContext, Executor, ExecutorRegistry};
pub use certs::{CertIssuer, RcgenIssuer};
pub use controller::{Controller, Reply, ResultRecord, Stage, TaskReport};
pub use core::{DeployError, EngineConfig, ErrorDetail, Result};
pub use driver::Driver;
pub use machine::{Machine, MachineConnector, ScriptedConnector, ScriptedResponse};
pub use model::{ClusterConfig, NodeConfig, Role};
pub use store::Store;
pub use task::{Processor, ProcessorRegistry, SplitContext, Task, TaskKind, TaskStatus, TaskType};
