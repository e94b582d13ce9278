use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The error triple carried on every action, task and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: String,
    pub detail: String,
    pub fix_hint: String,
}

impl ErrorDetail {
    pub fn new(
        reason: impl Into<String>,
        detail: impl Into<String>,
        fix_hint: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            detail: detail.into(),
            fix_hint: fix_hint.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)?;
        if !self.fix_hint.is_empty() {
            write!(f, " ({})", self.fix_hint)?;
        }
        Ok(())
    }
}

pub const REASON_CONNECTING_FAILED: &str = "connecting failed";
pub const REASON_SPLIT_FAILED: &str = "split failed";
pub const REASON_CANCELLED: &str = "cancelled";
pub const HINT_CHECK_REACHABILITY: &str =
    "check that the node is reachable and its SSH service is available";

/// Unified error type for the deployment engine
#[derive(Debug, Error)]
pub enum DeployError {
    /// A required configuration field is missing or invalid
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        field: Option<String>,
    },

    /// A task was constructed or split without the nodes it needs
    #[error("Empty nodes: {role}")]
    EmptyNodes { role: String },

    /// A processor or executor received a task/action of another kind
    #[error("Type mismatched: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// No executor/processor registered for a type
    #[error("Not found: {kind} {name}")]
    NotFound { kind: String, name: String },

    #[error("Already registered: {kind} {name}")]
    AlreadyRegistered { kind: String, name: String },

    #[error("Task already exists: {name}")]
    TaskExists { name: String },

    #[error("Task not found: {name}")]
    TaskMissing { name: String },

    #[error("Split failed for {task}: {message}")]
    SplitFailed { task: String, message: String },

    /// SSH/Docker dial failure
    #[error("Connecting to {node} failed: {message}")]
    Connection { node: String, message: String },

    /// Non-zero exit or transport error while running a remote command
    #[error("Remote command failed on {node}: {message}")]
    Remote {
        node: String,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Aggregate of failed items or children, named
    #[error("{} item(s) failed: [{}]", .items.len(), .items.join(", "))]
    ItemsFailed { items: Vec<String> },

    #[error("Certificate error: {message}")]
    Certificate { message: String },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DeployError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn empty_nodes<S: Into<String>>(role: S) -> Self {
        Self::EmptyNodes { role: role.into() }
    }

    pub fn type_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn not_found<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_registered<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        Self::AlreadyRegistered {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn split_failed<T: Into<String>, M: Into<String>>(task: T, message: M) -> Self {
        Self::SplitFailed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn connection<N: Into<String>, M: Into<String>>(node: N, message: M) -> Self {
        Self::Connection {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn remote<N: Into<String>, M: Into<String>>(node: N, message: M) -> Self {
        Self::Remote {
            node: node.into(),
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn items_failed<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ItemsFailed {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::Certificate {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Connection and timeout failures may succeed on a later attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Io { .. }
        )
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::EmptyNodes { .. } => "config",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyRegistered { .. } => "registry",
            Self::TaskExists { .. } | Self::TaskMissing { .. } => "store",
            Self::SplitFailed { .. } => "split",
            Self::Connection { .. } => "connection",
            Self::Remote { .. } => "remote",
            Self::ItemsFailed { .. } => "items",
            Self::Certificate { .. } => "certificate",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }

    /// Project into the user-facing (reason, detail, fix hint) triple
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Config { message, field } => ErrorDetail::new(
                "invalid config",
                match field {
                    Some(field) => format!("{field}: {message}"),
                    None => message.clone(),
                },
                "fix the request configuration and resubmit",
            ),
            Self::EmptyNodes { role } => ErrorDetail::new(
                "empty nodes",
                format!("no nodes given for {role}"),
                "add at least one node with this role",
            ),
            Self::TypeMismatch { .. } => ErrorDetail::new(
                "task type mismatched",
                self.to_string(),
                "this is an internal error, please report it",
            ),
            Self::NotFound { .. } | Self::AlreadyRegistered { .. } => ErrorDetail::new(
                "registry error",
                self.to_string(),
                "this is an internal error, please report it",
            ),
            Self::TaskExists { name } => ErrorDetail::new(
                "task exists",
                format!("task {name} is already known"),
                "wait for the running task or use another cluster name",
            ),
            Self::TaskMissing { name } => ErrorDetail::new(
                "task not found",
                format!("task {name} does not exist"),
                "check the task or cluster name",
            ),
            Self::SplitFailed { message, .. } => ErrorDetail::new(
                REASON_SPLIT_FAILED,
                message.clone(),
                "check the node list and cluster config",
            ),
            Self::Connection { node, message } => ErrorDetail::new(
                REASON_CONNECTING_FAILED,
                format!("{node}: {message}"),
                HINT_CHECK_REACHABILITY,
            ),
            Self::Remote {
                message,
                stdout,
                stderr,
                ..
            } => {
                let mut detail = message.clone();
                if !stdout.is_empty() {
                    detail.push_str("\nstdout: ");
                    detail.push_str(stdout);
                }
                if !stderr.is_empty() {
                    detail.push_str("\nstderr: ");
                    detail.push_str(stderr);
                }
                ErrorDetail::new(
                    "command failed",
                    detail,
                    "check the action log on the node for details",
                )
            }
            Self::ItemsFailed { .. } => ErrorDetail::new(
                "items failed",
                self.to_string(),
                "query the failed items and their logs for the root cause",
            ),
            Self::Certificate { message } => ErrorDetail::new(
                "certificate generation failed",
                message.clone(),
                "check the cluster name and node addresses",
            ),
            Self::Timeout { .. } => ErrorDetail::new(
                "timeout",
                self.to_string(),
                "check the service status on the node",
            ),
            Self::Cancelled { operation } => {
                ErrorDetail::new(REASON_CANCELLED, operation.clone(), "resubmit the request")
            }
            Self::Io { .. } | Self::Serialization { .. } | Self::Internal { .. } => {
                ErrorDetail::new(
                    "internal error",
                    self.to_string(),
                    "check the controller logs",
                )
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_yaml::Error> for DeployError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<DeployError> for ErrorDetail {
    fn from(err: DeployError) -> Self {
        err.detail()
    }
}
