//! Command lines and manifests sent to nodes.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use crate::core::{CheckItem, DeployError, Protocol, Result};
use crate::model::{ClusterConfig, NodeConfig};

pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
pub const KUBELET_KUBECONFIG: &str = "/etc/kubernetes/kubelet.conf";
pub const KUBEADM_CONFIG: &str = "/etc/kubernetes/kubeadm-config.yaml";
pub const ADDON_DIR: &str = "/etc/kubernetes/addons";
pub const ETCD_PKI_DIR: &str = "/etc/etcd/pki";
pub const MASTER_ETCD_PKI_DIR: &str = "/etc/kubernetes/pki/etcd";
pub const ETCD_DATA_DIR: &str = "/var/lib/etcd";
pub const CONTOUR_MANIFEST: &str = "https://projectcontour.io/quickstart/contour.yaml";
pub const FLANNEL_MANIFEST: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";

pub fn hostname() -> &'static str {
    "hostname"
}

pub fn cpu_count() -> &'static str {
    "nproc"
}

pub fn memory_mb() -> &'static str {
    "free -m | awk '/^Mem:/{print $2}'"
}

pub fn os_release() -> &'static str {
    "cat /etc/os-release"
}

pub fn container_runtime() -> &'static str {
    "systemctl is-active containerd || systemctl is-active docker"
}

/// Capture one packet of `item` from `source` on the destination node
pub fn capture(item: &CheckItem, source: &NodeConfig, limit: Duration) -> String {
    format!(
        "timeout {} tcpdump -i any -nn -c 1 '{} and dst port {} and src host {}'",
        limit.as_secs().max(1),
        item.protocol.as_str(),
        item.port,
        source.ip
    )
}

/// Send one probe for `item` to `destination`; exit status is not meaningful
pub fn probe(item: &CheckItem, destination: &NodeConfig) -> String {
    match item.protocol {
        Protocol::Tcp => format!("nc -z -w 2 {} {} || true", destination.ip, item.port),
        Protocol::Udp => format!(
            "echo kubedeploy | nc -u -w 1 {} {} || true",
            destination.ip, item.port
        ),
    }
}

/// Node preparation steps, by item name
pub fn node_init_steps(node: &NodeConfig) -> Vec<(&'static str, String)> {
    vec![
        (
            "hostname",
            format!("hostnamectl set-hostname {}", node.name),
        ),
        (
            "swap",
            "swapoff -a && sed -i '/ swap / s/^/#/' /etc/fstab".to_string(),
        ),
        (
            "kernel-modules",
            "modprobe overlay && modprobe br_netfilter".to_string(),
        ),
        (
            "sysctl",
            "printf 'net.bridge.bridge-nf-call-iptables = 1\\nnet.bridge.bridge-nf-call-ip6tables = 1\\nnet.ipv4.ip_forward = 1\\n' > /etc/sysctl.d/99-kubernetes.conf && sysctl --system".to_string(),
        ),
        ("container-runtime", container_runtime().to_string()),
    ]
}

/// `--initial-cluster` value for the etcd members
pub fn etcd_initial_cluster(peers: &[NodeConfig]) -> String {
    peers
        .iter()
        .map(|peer| format!("{}=https://{}:2380", peer.name, peer.ip))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn etcd_args(node: &NodeConfig, peers: &[NodeConfig], cluster: &ClusterConfig) -> Vec<String> {
    vec![
        "etcd".to_string(),
        format!("--name={}", node.name),
        format!("--data-dir={ETCD_DATA_DIR}"),
        format!("--listen-client-urls=https://{}:2379,https://127.0.0.1:2379", node.ip),
        format!("--advertise-client-urls=https://{}:2379", node.ip),
        format!("--listen-peer-urls=https://{}:2380", node.ip),
        format!("--initial-advertise-peer-urls=https://{}:2380", node.ip),
        format!("--initial-cluster={}", etcd_initial_cluster(peers)),
        format!("--initial-cluster-token={}-etcd", cluster.name),
        "--initial-cluster-state=new".to_string(),
        "--client-cert-auth=true".to_string(),
        "--peer-client-cert-auth=true".to_string(),
        format!("--trusted-ca-file={ETCD_PKI_DIR}/ca.crt"),
        format!("--cert-file={ETCD_PKI_DIR}/server.crt"),
        format!("--key-file={ETCD_PKI_DIR}/server.key"),
        format!("--peer-trusted-ca-file={ETCD_PKI_DIR}/ca.crt"),
        format!("--peer-cert-file={ETCD_PKI_DIR}/peer.crt"),
        format!("--peer-key-file={ETCD_PKI_DIR}/peer.key"),
    ]
}

pub fn etcd_health(node: &NodeConfig) -> String {
    format!(
        "docker exec etcd etcdctl --endpoints=https://{}:2379 --cacert={ETCD_PKI_DIR}/ca.crt --cert={ETCD_PKI_DIR}/apiserver-etcd-client.crt --key={ETCD_PKI_DIR}/apiserver-etcd-client.key endpoint health",
        node.ip
    )
}

/// kubeadm configuration for the first master, using the external etcd cluster
pub fn kubeadm_init_config(
    cluster: &ClusterConfig,
    first_master: &NodeConfig,
    masters: &[NodeConfig],
    etcd_nodes: &[NodeConfig],
) -> Result<String> {
    let token = cluster
        .bootstrap_token
        .as_deref()
        .ok_or_else(|| DeployError::config_field("missing", "cluster.bootstrap_token"))?;
    let certificate_key = cluster
        .certificate_key
        .as_deref()
        .ok_or_else(|| DeployError::config_field("missing", "cluster.certificate_key"))?;
    if etcd_nodes.is_empty() {
        return Err(DeployError::empty_nodes("etcd"));
    }

    let mut out = String::new();
    let _ = writeln!(out, "apiVersion: kubeadm.k8s.io/v1beta3");
    let _ = writeln!(out, "kind: InitConfiguration");
    let _ = writeln!(out, "bootstrapTokens:");
    let _ = writeln!(out, "- token: \"{token}\"");
    let _ = writeln!(out, "  ttl: 24h0m0s");
    let _ = writeln!(out, "certificateKey: \"{certificate_key}\"");
    let _ = writeln!(out, "localAPIEndpoint:");
    let _ = writeln!(out, "  advertiseAddress: {}", first_master.ip);
    let _ = writeln!(out, "nodeRegistration:");
    let _ = writeln!(out, "  name: {}", first_master.name);
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "apiVersion: kubeadm.k8s.io/v1beta3");
    let _ = writeln!(out, "kind: ClusterConfiguration");
    let _ = writeln!(out, "clusterName: {}", cluster.name);
    let _ = writeln!(out, "kubernetesVersion: {}", cluster.kubernetes_version);
    let _ = writeln!(out, "imageRepository: {}", cluster.image_repository);
    let _ = writeln!(out, "controlPlaneEndpoint: {}", cluster.api_endpoint(first_master));
    let _ = writeln!(out, "networking:");
    let _ = writeln!(out, "  podSubnet: {}", cluster.pod_subnet);
    let _ = writeln!(out, "  serviceSubnet: {}", cluster.service_subnet);
    let _ = writeln!(out, "apiServer:");
    let _ = writeln!(out, "  certSANs:");
    for master in masters {
        let _ = writeln!(out, "  - {}", master.ip);
        let _ = writeln!(out, "  - {}", master.name);
    }
    let _ = writeln!(out, "etcd:");
    let _ = writeln!(out, "  external:");
    let _ = writeln!(out, "    endpoints:");
    for node in etcd_nodes {
        let _ = writeln!(out, "    - https://{}:2379", node.ip);
    }
    let _ = writeln!(out, "    caFile: {MASTER_ETCD_PKI_DIR}/ca.crt");
    let _ = writeln!(out, "    certFile: {MASTER_ETCD_PKI_DIR}/apiserver-etcd-client.crt");
    let _ = writeln!(out, "    keyFile: {MASTER_ETCD_PKI_DIR}/apiserver-etcd-client.key");
    Ok(out)
}

pub fn kubeadm_init() -> String {
    format!("kubeadm init --config {KUBEADM_CONFIG} --upload-certs")
}

pub fn kubeadm_join(cluster: &ClusterConfig, first_master: &NodeConfig, control_plane: bool) -> Result<String> {
    let token = cluster
        .bootstrap_token
        .as_deref()
        .ok_or_else(|| DeployError::config_field("missing", "cluster.bootstrap_token"))?;
    let mut command = format!(
        "kubeadm join {} --token {} --discovery-token-unsafe-skip-ca-verification",
        cluster.api_endpoint(first_master),
        token
    );
    if control_plane {
        let key = cluster
            .certificate_key
            .as_deref()
            .ok_or_else(|| DeployError::config_field("missing", "cluster.certificate_key"))?;
        let _ = write!(command, " --control-plane --certificate-key {key}");
    }
    Ok(command)
}

pub fn already_joined() -> String {
    format!("test -f {KUBELET_KUBECONFIG}")
}

pub fn kubectl(args: &str) -> String {
    format!("kubectl --kubeconfig {ADMIN_KUBECONFIG} {args}")
}

pub fn label_node(target: &str, labels: &BTreeMap<String, String>) -> Result<String> {
    if labels.is_empty() {
        return Err(DeployError::config_field("no labels given", "labels"));
    }
    let pairs = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    Ok(kubectl(&format!("label node {target} --overwrite {pairs}")))
}

/// ConfigMap recording the settings the cluster was deployed with
pub fn cluster_settings_manifest(cluster: &ClusterConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "apiVersion: v1");
    let _ = writeln!(out, "kind: ConfigMap");
    let _ = writeln!(out, "metadata:");
    let _ = writeln!(out, "  name: kubedeploy-cluster");
    let _ = writeln!(out, "  namespace: kube-system");
    let _ = writeln!(out, "data:");
    let _ = writeln!(out, "  clusterName: \"{}\"", cluster.name);
    let _ = writeln!(out, "  kubernetesVersion: \"{}\"", cluster.kubernetes_version);
    let _ = writeln!(out, "  podSubnet: \"{}\"", cluster.pod_subnet);
    let _ = writeln!(out, "  serviceSubnet: \"{}\"", cluster.service_subnet);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_requires_token() {
        let cluster = ClusterConfig::new("c");
        let master = NodeConfig::new("m1", "10.0.0.1");
        assert!(kubeadm_join(&cluster, &master, false).is_err());
    }

    #[test]
    fn test_control_plane_join_flags() {
        let mut cluster = ClusterConfig::new("c");
        cluster.ensure_join_secrets();
        let master = NodeConfig::new("m1", "10.0.0.1");
        let join = kubeadm_join(&cluster, &master, true).unwrap();
        assert!(join.starts_with("kubeadm join 10.0.0.1:6443 --token "));
        assert!(join.contains("--control-plane --certificate-key "));
        assert!(!kubeadm_join(&cluster, &master, false).unwrap().contains("--control-plane"));
    }

    #[test]
    fn test_init_config_lists_external_etcd() {
        let mut cluster = ClusterConfig::new("c");
        cluster.ensure_join_secrets();
        let master = NodeConfig::new("m1", "10.0.0.1");
        let etcd = vec![NodeConfig::new("e1", "10.0.1.1"), NodeConfig::new("e2", "10.0.1.2")];
        let config = kubeadm_init_config(&cluster, &master, &[master.clone()], &etcd).unwrap();
        assert!(config.contains("- https://10.0.1.1:2379"));
        assert!(config.contains("- https://10.0.1.2:2379"));
        assert!(config.contains("controlPlaneEndpoint: 10.0.0.1:6443"));
        assert!(kubeadm_init_config(&cluster, &master, &[], &[]).is_err());
    }

    #[test]
    fn test_initial_cluster() {
        let peers = vec![NodeConfig::new("e1", "10.0.1.1"), NodeConfig::new("e2", "10.0.1.2")];
        assert_eq!(
            etcd_initial_cluster(&peers),
            "e1=https://10.0.1.1:2380,e2=https://10.0.1.2:2380"
        );
    }

    #[test]
    fn test_label_requires_labels() {
        assert!(label_node("n1", &BTreeMap::new()).is_err());
        let labels = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        assert!(label_node("n1", &labels).unwrap().ends_with("label node n1 --overwrite zone=a"));
    }
}
