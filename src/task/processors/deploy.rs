use std::sync::Arc;

use super::{action, mismatch, per_node};
use crate::action::ActionKind;
use crate::core::{DeployError, Result};
use crate::model::{NodeConfig, Role};
use crate::task::{Processor, SplitContext, Task, TaskKind, TaskType};

pub const PRIORITY_INIT: u32 = 10;
pub const PRIORITY_ETCD: u32 = 20;
pub const PRIORITY_MASTER: u32 = 30;
pub const PRIORITY_WORKER: u32 = 40;
pub const PRIORITY_INGRESS: u32 = 50;

pub const PRIORITY_INIT_MASTER: u32 = 10;
pub const PRIORITY_JOIN_MASTER: u32 = 20;
pub const PRIORITY_CONFIG: u32 = 30;

fn with_role(nodes: &[NodeConfig], role: Role) -> Vec<NodeConfig> {
    nodes.iter().filter(|node| node.has_role(role)).cloned().collect()
}

/// Group nodes by role into init, etcd, master, worker and ingress bands.
///
/// Etcd and master are mandatory. Worker and ingress are skipped when no node
/// carries the role; an ingress failure does not fail the deployment.
pub struct DeployProcessor;

impl Processor for DeployProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::Deploy { cluster, nodes } = task.kind() else {
            return Err(mismatch(TaskType::Deploy, task));
        };
        let etcd = with_role(nodes, Role::Etcd);
        if etcd.is_empty() {
            return Err(DeployError::empty_nodes(Role::Etcd.as_str()));
        }
        let masters = with_role(nodes, Role::Master);
        let Some(first_master) = masters.first().cloned() else {
            return Err(DeployError::empty_nodes(Role::Master.as_str()));
        };
        let workers = with_role(nodes, Role::Worker);
        let ingress = with_role(nodes, Role::Ingress);

        let mut sub_tasks = vec![
            task.child(
                "init",
                TaskKind::NodeInit {
                    cluster: cluster.clone(),
                    nodes: nodes.clone(),
                },
                PRIORITY_INIT,
                false,
            ),
            task.child(
                Role::Etcd.as_str(),
                TaskKind::DeployEtcd {
                    cluster: cluster.clone(),
                    nodes: etcd.clone(),
                },
                PRIORITY_ETCD,
                false,
            ),
            task.child(
                Role::Master.as_str(),
                TaskKind::DeployMaster {
                    cluster: cluster.clone(),
                    masters,
                    etcd_nodes: etcd,
                },
                PRIORITY_MASTER,
                false,
            ),
        ];
        if !workers.is_empty() {
            sub_tasks.push(task.child(
                Role::Worker.as_str(),
                TaskKind::DeployWorker {
                    cluster: cluster.clone(),
                    nodes: workers,
                    first_master: first_master.clone(),
                },
                PRIORITY_WORKER,
                false,
            ));
        }
        if !ingress.is_empty() {
            sub_tasks.push(task.child(
                Role::Ingress.as_str(),
                TaskKind::DeployIngress {
                    cluster: cluster.clone(),
                    nodes: ingress,
                    first_master,
                },
                PRIORITY_INGRESS,
                true,
            ));
        }
        task.attach_sub_tasks(sub_tasks)
    }
}

pub struct NodeInitProcessor;

impl Processor for NodeInitProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::NodeInit { cluster, nodes } = task.kind() else {
            return Err(mismatch(TaskType::NodeInit, task));
        };
        let actions = per_node(task, nodes, "init", |_| ActionKind::NodeInit {
            cluster: cluster.clone(),
        })?;
        task.attach_actions(actions)
    }
}

/// master[0] initializes, the rest join, then cluster add-ons are applied
pub struct DeployMasterProcessor;

impl Processor for DeployMasterProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployMaster {
            cluster,
            masters,
            etcd_nodes,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::DeployMaster, task));
        };
        let Some(first_master) = masters.first() else {
            return Err(DeployError::empty_nodes(Role::Master.as_str()));
        };
        if etcd_nodes.is_empty() {
            return Err(DeployError::empty_nodes(Role::Etcd.as_str()));
        }

        let mut sub_tasks = vec![task.child(
            "init-master",
            TaskKind::InitMaster {
                cluster: cluster.clone(),
                masters: Arc::new(masters.clone()),
                etcd_nodes: Arc::new(etcd_nodes.clone()),
            },
            PRIORITY_INIT_MASTER,
            false,
        )];
        for node in &masters[1..] {
            sub_tasks.push(task.child(
                format!("join-master-{}", node.name),
                TaskKind::JoinMaster {
                    cluster: cluster.clone(),
                    node: node.clone(),
                    first_master: first_master.clone(),
                },
                PRIORITY_JOIN_MASTER,
                false,
            ));
        }
        sub_tasks.push(task.child(
            "config",
            TaskKind::DeployConfig {
                cluster: cluster.clone(),
                master: first_master.clone(),
            },
            PRIORITY_CONFIG,
            false,
        ));
        task.attach_sub_tasks(sub_tasks)
    }
}

pub struct InitMasterProcessor;

impl Processor for InitMasterProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::InitMaster {
            cluster,
            masters,
            etcd_nodes,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::InitMaster, task));
        };
        let first_master = masters
            .first()
            .ok_or_else(|| DeployError::empty_nodes(Role::Master.as_str()))?;
        task.attach_actions(vec![action(
            task,
            first_master,
            ActionKind::InitMaster {
                cluster: cluster.clone(),
                etcd_nodes: etcd_nodes.clone(),
                masters: masters.clone(),
            },
        )])
    }
}

pub struct JoinMasterProcessor;

impl Processor for JoinMasterProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::JoinMaster {
            cluster,
            node,
            first_master,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::JoinMaster, task));
        };
        task.attach_actions(vec![action(
            task,
            node,
            ActionKind::JoinMaster {
                cluster: cluster.clone(),
                first_master: first_master.clone(),
            },
        )])
    }
}

pub struct DeployConfigProcessor;

impl Processor for DeployConfigProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployConfig { cluster, master } = task.kind() else {
            return Err(mismatch(TaskType::DeployConfig, task));
        };
        task.attach_actions(vec![action(
            task,
            master,
            ActionKind::DeployConfig {
                cluster: cluster.clone(),
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{node, split_ctx};
    use super::*;
    use crate::action::ActionType;
    use crate::model::ClusterConfig;
    use crate::task::ProcessorRegistry;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn deploy(nodes: Vec<NodeConfig>) -> Arc<Task> {
        Task::new_deploy("c1", ClusterConfig::new("c1"), nodes, Path::new("/tmp/logs")).unwrap()
    }

    fn bands(task: &Task) -> Vec<(String, u32, bool)> {
        task.sub_tasks()
            .iter()
            .map(|t| (t.name().to_string(), t.priority(), t.failure_can_be_ignored()))
            .collect()
    }

    #[test]
    fn test_deploy_bands_by_role() {
        let task = deploy(vec![
            node("m1", "10.0.0.1", &[Role::Master, Role::Etcd]),
            node("w1", "10.0.0.2", &[Role::Worker, Role::Ingress]),
        ]);
        DeployProcessor.split_task(&task, &split_ctx()).unwrap();
        assert_eq!(
            bands(&task),
            vec![
                ("init".to_string(), 10, false),
                ("etcd".to_string(), 20, false),
                ("master".to_string(), 30, false),
                ("worker".to_string(), 40, false),
                ("ingress".to_string(), 50, true),
            ]
        );
    }

    #[test]
    fn test_optional_roles_skipped_and_mandatory_enforced() {
        let task = deploy(vec![node("m1", "10.0.0.1", &[Role::Master, Role::Etcd])]);
        DeployProcessor.split_task(&task, &split_ctx()).unwrap();
        assert_eq!(task.sub_tasks().len(), 3);

        let task = deploy(vec![node("m1", "10.0.0.1", &[Role::Master])]);
        let err = DeployProcessor.split_task(&task, &split_ctx()).unwrap_err();
        assert!(matches!(err, DeployError::EmptyNodes { ref role } if role == "etcd"));
        assert!(!task.has_children());
    }

    #[test]
    fn test_master_split_init_join_config() {
        let task = deploy(vec![
            node("m1", "10.0.0.1", &[Role::Master, Role::Etcd]),
            node("m2", "10.0.0.2", &[Role::Master]),
            node("m3", "10.0.0.3", &[Role::Master]),
        ]);
        let registry = ProcessorRegistry::with_defaults().unwrap();
        let ctx = split_ctx();
        registry.split_task(&task, &ctx).unwrap();
        let master = task.find("master").unwrap();
        registry.split_task(&master, &ctx).unwrap();

        assert_eq!(
            bands(&master),
            vec![
                ("init-master".to_string(), 10, false),
                ("join-master-m2".to_string(), 20, false),
                ("join-master-m3".to_string(), 20, false),
                ("config".to_string(), 30, false),
            ]
        );
        for sub_task in master.sub_tasks() {
            registry.split_task(&sub_task, &ctx).unwrap();
        }
        let actions: Vec<(ActionType, String)> = master
            .all_actions()
            .iter()
            .map(|a| (a.action_type(), a.node().name.clone()))
            .collect();
        assert_eq!(
            actions,
            vec![
                (ActionType::InitMaster, "m1".to_string()),
                (ActionType::JoinMaster, "m2".to_string()),
                (ActionType::JoinMaster, "m3".to_string()),
                (ActionType::DeployConfig, "m1".to_string()),
            ]
        );
    }

    #[test]
    fn test_wrong_kind_is_type_mismatch() {
        let task = Task::new_test_connection(
            "t",
            vec![NodeConfig::new("n1", "10.0.0.1")],
            Path::new("/tmp"),
        )
        .unwrap();
        assert!(matches!(
            DeployMasterProcessor.split_task(&task, &split_ctx()),
            Err(DeployError::TypeMismatch { .. })
        ));
    }
}
