use std::sync::Arc;

use super::{action, mismatch};
use crate::action::ActionKind;
use crate::certs::{CertConfig, CertUsage};
use crate::core::{DeployError, Result};
use crate::model::{NodeConfig, Role};
use crate::task::{Processor, SplitContext, Task, TaskKind, TaskType};

/// One DeployEtcd action per node.
///
/// The CA and the apiserver client certificate are generated once per task
/// and shared by every action; server and peer certificates are per node.
pub struct DeployEtcdProcessor;

fn alt_names(node: &NodeConfig) -> Vec<String> {
    vec![
        node.name.clone(),
        node.ip.clone(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ]
}

impl Processor for DeployEtcdProcessor {
    fn split_task(&self, task: &Task, ctx: &SplitContext) -> Result<()> {
        let TaskKind::DeployEtcd { cluster, nodes } = task.kind() else {
            return Err(mismatch(TaskType::DeployEtcd, task));
        };
        if nodes.is_empty() {
            return Err(DeployError::empty_nodes(Role::Etcd.as_str()));
        }

        let ca = ctx.issuer.create_ca(&CertConfig::ca(format!("{}-etcd-ca", cluster.name)))?;
        let mut client_config = CertConfig::leaf("kube-apiserver-etcd-client", Vec::new(), vec![CertUsage::Client]);
        client_config.organization = Some("system:masters".to_string());
        let client = ctx
            .issuer
            .create_from_ca(&client_config, &ca.cert_pem, &ca.key_pem)?;

        let ca = Arc::new(ca);
        let client = Arc::new(client);
        let peers = Arc::new(nodes.clone());
        let mut actions = Vec::with_capacity(nodes.len());
        for node in nodes {
            let usages = vec![CertUsage::Server, CertUsage::Client];
            let server = ctx.issuer.create_from_ca(
                &CertConfig::leaf(&node.name, alt_names(node), usages.clone()),
                &ca.cert_pem,
                &ca.key_pem,
            )?;
            let peer = ctx.issuer.create_from_ca(
                &CertConfig::leaf(&node.name, alt_names(node), usages),
                &ca.cert_pem,
                &ca.key_pem,
            )?;
            actions.push(action(
                task,
                node,
                ActionKind::DeployEtcd {
                    cluster: cluster.clone(),
                    peers: peers.clone(),
                    ca: ca.clone(),
                    client: client.clone(),
                    server,
                    peer,
                },
            ));
        }
        task.attach_actions(actions)
    }
}
