use serde::{Deserialize, Serialize};

use super::node::NodeConfig;
use crate::core::{DeployError, Result};

/// How the API server is reached by nodes joining the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ApiServerEndpoint {
    /// The first master's address
    FirstMaster { port: u16 },
    /// An externally managed load balancer or VIP
    LoadBalancer { address: String, port: u16 },
}

impl Default for ApiServerEndpoint {
    fn default() -> Self {
        ApiServerEndpoint::FirstMaster { port: 6443 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub kubernetes_version: String,
    pub etcd_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    #[serde(default)]
    pub api_server: ApiServerEndpoint,
    pub image_repository: String,
    /// kubeadm bootstrap token; generated when absent
    #[serde(default)]
    pub bootstrap_token: Option<String>,
    /// kubeadm certificate key for control-plane joins; generated when absent
    #[serde(default)]
    pub certificate_key: Option<String>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kubernetes_version: "v1.28.2".to_string(),
            etcd_version: "3.5.9".to_string(),
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/12".to_string(),
            api_server: ApiServerEndpoint::default(),
            image_repository: "registry.k8s.io".to_string(),
            bootstrap_token: None,
            certificate_key: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DeployError::config_field("must not be empty", "cluster.name"));
        }
        if self.kubernetes_version.trim().is_empty() {
            return Err(DeployError::config_field(
                "must not be empty",
                "cluster.kubernetes_version",
            ));
        }
        if !self.pod_subnet.contains('/') {
            return Err(DeployError::config_field("expected CIDR", "cluster.pod_subnet"));
        }
        if !self.service_subnet.contains('/') {
            return Err(DeployError::config_field(
                "expected CIDR",
                "cluster.service_subnet",
            ));
        }
        Ok(())
    }

    /// Fill the join secrets in place if the request did not carry them
    pub fn ensure_join_secrets(&mut self) {
        if self.bootstrap_token.is_none() {
            self.bootstrap_token = Some(format!(
                "{}.{}",
                random_lower_alnum(6),
                random_lower_alnum(16)
            ));
        }
        if self.certificate_key.is_none() {
            self.certificate_key = Some(random_hex(64));
        }
    }

    /// `host:port` of the API server as seen by joining nodes
    pub fn api_endpoint(&self, first_master: &NodeConfig) -> String {
        match &self.api_server {
            ApiServerEndpoint::FirstMaster { port } => format!("{}:{}", first_master.ip, port),
            ApiServerEndpoint::LoadBalancer { address, port } => format!("{address}:{port}"),
        }
    }
}

fn random_lower_alnum(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARSET[fastrand::usize(..CHARSET.len())] as char)
        .collect()
}

fn random_hex(len: usize) -> String {
    (0..len)
        .map(|_| char::from_digit(fastrand::u32(..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_secrets_generated_once() {
        let mut cluster = ClusterConfig::new("prod");
        cluster.ensure_join_secrets();
        let token = cluster.bootstrap_token.clone().unwrap();
        let (id, secret) = token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert_eq!(cluster.certificate_key.as_ref().unwrap().len(), 64);

        cluster.ensure_join_secrets();
        assert_eq!(cluster.bootstrap_token.unwrap(), token);
    }

    #[test]
    fn test_api_endpoint() {
        let master = NodeConfig::new("m1", "10.0.0.1");
        let mut cluster = ClusterConfig::new("c");
        assert_eq!(cluster.api_endpoint(&master), "10.0.0.1:6443");
        cluster.api_server = ApiServerEndpoint::LoadBalancer {
            address: "10.0.0.100".into(),
            port: 8443,
        };
        assert_eq!(cluster.api_endpoint(&master), "10.0.0.100:8443");
    }

    #[test]
    fn test_validate() {
        assert!(ClusterConfig::new("c").validate().is_ok());
        let mut cluster = ClusterConfig::new(" ");
        assert!(cluster.validate().is_err());
        cluster.name = "c".into();
        cluster.pod_subnet = "10.244.0.0".into();
        assert!(cluster.validate().is_err());
    }
}
