//! Request and reply shapes at the RPC boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::projection::Stage;
use crate::action::{ActionItem, ActionStatus, ActionType};
use crate::core::{DeployError, ErrorDetail};
use crate::model::{ClusterConfig, NodeConfig};
use crate::task::{TaskStatus, TaskSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub cluster: ClusterConfig,
    pub nodes: Vec<NodeConfig>,
}

/// Pre-flight requests (node check, connectivity check, test connection)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesRequest {
    pub name: String,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodesRequest {
    /// Must carry the bootstrap token of the running cluster
    pub cluster: ClusterConfig,
    pub first_master: NodeConfig,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchKubeConfigRequest {
    pub cluster_name: String,
    pub master: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLabelRequest {
    pub cluster_name: String,
    pub master: NodeConfig,
    pub nodes: Vec<NodeConfig>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRequest {
    pub task: String,
    #[serde(default)]
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    pub task: String,
    pub node: String,
    #[serde(default)]
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub accepted: bool,
    /// Name of the launched task, used for result and log queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl Reply {
    pub fn accepted(task: impl Into<String>) -> Self {
        Self {
            accepted: true,
            task: Some(task.into()),
            error: None,
        }
    }

    pub fn rejected(error: ErrorDetail) -> Self {
        Self {
            accepted: false,
            task: None,
            error: Some(error),
        }
    }
}

impl From<DeployError> for Reply {
    fn from(error: DeployError) -> Self {
        Reply::rejected(error.detail())
    }
}

/// One action's outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Absent for cluster-wide actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub action: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Per-port or per-check outcomes of check actions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ActionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub summary: TaskSummary,
    pub records: Vec<ResultRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_omits_empty_fields() {
        let json = serde_json::to_value(Reply::accepted("c1")).unwrap();
        assert_eq!(json, serde_json::json!({"accepted": true, "task": "c1"}));

        let json = serde_json::to_value(Reply::from(DeployError::empty_nodes("etcd"))).unwrap();
        assert_eq!(json["accepted"], false);
        assert_eq!(json["error"]["reason"], "empty nodes");
        assert!(json.get("task").is_none());
    }

    #[test]
    fn test_record_omits_missing_node_and_error() {
        let record = ResultRecord {
            node_name: None,
            action: "deploy-contour-abc".to_string(),
            action_type: ActionType::DeployContour,
            status: ActionStatus::Done,
            error: None,
            items: Vec::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "action": "deploy-contour-abc",
                "action_type": "deploy-contour",
                "status": "Done"
            })
        );
    }

    #[test]
    fn test_result_request_stage_defaults() {
        let request: ResultRequest = serde_yaml::from_str("task: c1\n").unwrap();
        assert!(request.stage.is_none());
        let request: ResultRequest = serde_yaml::from_str("task: c1\nstage: ingress\n").unwrap();
        assert_eq!(request.stage, Some(Stage::Ingress));
    }
}
