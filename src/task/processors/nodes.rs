use super::{action, mismatch, per_node};
use crate::action::ActionKind;
use crate::core::Result;
use crate::model::{NodeConfig, Role};
use crate::task::{Processor, SplitContext, Task, TaskKind, TaskType};

pub struct DeployWorkerProcessor;

impl Processor for DeployWorkerProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployWorker {
            cluster,
            nodes,
            first_master,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::DeployWorker, task));
        };
        let actions = per_node(task, nodes, Role::Worker.as_str(), |_| ActionKind::DeployWorker {
            cluster: cluster.clone(),
            first_master: first_master.clone(),
        })?;
        task.attach_actions(actions)
    }
}

/// One action per ingress node plus one cluster-wide Contour install
pub struct DeployIngressProcessor;

impl Processor for DeployIngressProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployIngress {
            cluster,
            nodes,
            first_master,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::DeployIngress, task));
        };
        let mut actions = per_node(task, nodes, Role::Ingress.as_str(), |_| ActionKind::DeployIngress {
            cluster: cluster.clone(),
            first_master: first_master.clone(),
        })?;
        actions.push(action(
            task,
            first_master,
            ActionKind::DeployContour {
                cluster: cluster.clone(),
            },
        ));
        task.attach_actions(actions)
    }
}

pub struct DeployNodeProcessor;

impl Processor for DeployNodeProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployNode {
            cluster,
            nodes,
            first_master,
        } = task.kind()
        else {
            return Err(mismatch(TaskType::DeployNode, task));
        };
        let actions = per_node(task, nodes, Role::Worker.as_str(), |_| ActionKind::DeployNode {
            cluster: cluster.clone(),
            first_master: first_master.clone(),
        })?;
        task.attach_actions(actions)
    }
}

pub struct NodeCheckProcessor;

impl Processor for NodeCheckProcessor {
    fn split_task(&self, task: &Task, ctx: &SplitContext) -> Result<()> {
        let TaskKind::NodeCheck { nodes } = task.kind() else {
            return Err(mismatch(TaskType::NodeCheck, task));
        };
        let actions = per_node(task, nodes, "node check", |_| ActionKind::NodeCheck {
            requirements: ctx.config.node_requirements,
        })?;
        task.attach_actions(actions)
    }
}

/// Index of a uniformly drawn node other than `own`; `len` must be at least 2
pub(crate) fn random_peer(own: usize, len: usize) -> usize {
    let drawn = fastrand::usize(..len - 1);
    if drawn == own {
        len - 1
    } else {
        drawn
    }
}

/// Each node probes one random other node. A single node has nobody to probe.
pub struct ConnectivityCheckProcessor;

impl Processor for ConnectivityCheckProcessor {
    fn split_task(&self, task: &Task, ctx: &SplitContext) -> Result<()> {
        let TaskKind::ConnectivityCheck { nodes } = task.kind() else {
            return Err(mismatch(TaskType::ConnectivityCheck, task));
        };
        if nodes.len() < 2 {
            return Ok(());
        }
        let actions = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let destination: &NodeConfig = &nodes[random_peer(index, nodes.len())];
                action(
                    task,
                    node,
                    ActionKind::ConnectivityCheck {
                        destination: destination.clone(),
                        items: ctx.config.connectivity_items.clone(),
                    },
                )
            })
            .collect();
        task.attach_actions(actions)
    }
}

pub struct TestConnectionProcessor;

impl Processor for TestConnectionProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::TestConnection { nodes } = task.kind() else {
            return Err(mismatch(TaskType::TestConnection, task));
        };
        let actions = per_node(task, nodes, "test connection", |_| ActionKind::TestConnection)?;
        task.attach_actions(actions)
    }
}

/// Fetch the admin kubeconfig into the task log directory
pub struct FetchKubeConfigProcessor;

impl Processor for FetchKubeConfigProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::FetchKubeConfig { master } = task.kind() else {
            return Err(mismatch(TaskType::FetchKubeConfig, task));
        };
        task.attach_actions(vec![action(
            task,
            master,
            ActionKind::FetchKubeConfig {
                destination: task.log_dir().join("admin.conf"),
            },
        )])
    }
}

pub struct AppendLabelProcessor;

impl Processor for AppendLabelProcessor {
    fn split_task(&self, task: &Task, _ctx: &SplitContext) -> Result<()> {
        let TaskKind::AppendLabel { master, nodes, labels } = task.kind() else {
            return Err(mismatch(TaskType::AppendLabel, task));
        };
        let actions = per_node(task, nodes, "label", |_| ActionKind::AppendLabel {
            master: master.clone(),
            labels: labels.clone(),
        })?;
        task.attach_actions(actions)
    }
}
