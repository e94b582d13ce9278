//! Flattening of task trees into result records.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::dto::ResultRecord;
use crate::action::{Action, ActionType};
use crate::model::Role;
use crate::task::Task;

/// Deployment stage a caller can filter results and logs by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Etcd,
    Master,
    Worker,
    Ingress,
}

impl Stage {
    pub fn action_types(&self) -> &'static [ActionType] {
        match self {
            Stage::Init => &[ActionType::NodeInit],
            Stage::Etcd => &[ActionType::DeployEtcd],
            Stage::Master => &[ActionType::InitMaster, ActionType::JoinMaster, ActionType::DeployConfig],
            Stage::Worker => &[ActionType::DeployWorker, ActionType::DeployNode],
            Stage::Ingress => &[ActionType::DeployIngress, ActionType::DeployContour],
        }
    }

    pub fn matches(&self, action: &Action) -> bool {
        self.action_types().contains(&action.action_type())
    }
}

impl From<Role> for Stage {
    fn from(role: Role) -> Self {
        match role {
            Role::Etcd => Stage::Etcd,
            Role::Master => Stage::Master,
            Role::Worker => Stage::Worker,
            Role::Ingress => Stage::Ingress,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Etcd => "etcd",
            Stage::Master => "master",
            Stage::Worker => "worker",
            Stage::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

pub fn record(action: &Action) -> ResultRecord {
    ResultRecord {
        node_name: (!action.action_type().is_cluster_wide()).then(|| action.node().name.clone()),
        action: action.name().to_string(),
        action_type: action.action_type(),
        status: action.status(),
        error: action.error(),
        items: action.items(),
    }
}

/// One record per action in `task`'s tree accepted by `filter`, in tree order
pub fn project(task: &Task, filter: impl Fn(&Action) -> bool) -> Vec<ResultRecord> {
    task.all_actions()
        .iter()
        .filter(|action| filter(action))
        .map(|action| record(action))
        .collect()
}

/// Project with an optional stage filter
pub fn project_stage(task: &Task, stage: Option<Stage>) -> Vec<ResultRecord> {
    project(task, |action| stage.map_or(true, |stage| stage.matches(action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, ActionStatus};
    use crate::core::ErrorDetail;
    use crate::model::{ClusterConfig, NodeConfig};
    use crate::task::TaskKind;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_stage_filter_and_order() {
        let root = Task::new_test_connection("root", vec![NodeConfig::new("m1", "10.0.0.1")], Path::new("/tmp")).unwrap();
        let cluster = Arc::new(ClusterConfig::new("c"));
        let master = root.child("master", TaskKind::TestConnection { nodes: vec![] }, 30, false);
        let ingress = root.child("ingress", TaskKind::TestConnection { nodes: vec![] }, 50, true);
        let m1 = NodeConfig::new("m1", "10.0.0.1");
        let i1 = NodeConfig::new("i1", "10.0.0.2");

        let init = Arc::new(Action::new(
            "master",
            master.log_dir(),
            m1.clone(),
            ActionKind::JoinMaster {
                cluster: cluster.clone(),
                first_master: m1.clone(),
            },
        ));
        init.begin().unwrap();
        init.finish(Err(ErrorDetail::new("command failed", "exit 1", ""))).unwrap();
        master.attach_actions(vec![init]).unwrap();
        ingress
            .attach_actions(vec![
                Arc::new(Action::new(
                    "ingress",
                    ingress.log_dir(),
                    i1.clone(),
                    ActionKind::DeployIngress {
                        cluster: cluster.clone(),
                        first_master: m1.clone(),
                    },
                )),
                Arc::new(Action::new("ingress", ingress.log_dir(), m1, ActionKind::DeployContour { cluster })),
            ])
            .unwrap();
        root.attach_sub_tasks(vec![ingress, master]).unwrap();

        let all = project_stage(&root, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].node_name.as_deref(), Some("m1"));
        assert_eq!(all[0].status, ActionStatus::Failed);
        assert_eq!(all[0].error.as_ref().unwrap().reason, "command failed");

        let ingress_records = project_stage(&root, Some(Stage::from(Role::Ingress)));
        assert_eq!(ingress_records.len(), 2);
        assert_eq!(ingress_records[0].node_name.as_deref(), Some("i1"));
        assert_eq!(ingress_records[1].node_name, None);
        assert!(ingress_records[1].error.is_none());

        assert!(project_stage(&root, Some(Stage::Etcd)).is_empty());
    }
}
