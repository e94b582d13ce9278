//! End-to-end deployments against the scripted connector
//!
//! Every command succeeds unless a rule says otherwise, so these tests only
//! script the commands whose outcome matters for the scenario.

use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kubedeploy::controller::{Controller, DeployRequest, LogRequest, ResultRequest, Stage};
use kubedeploy::machine::{ScriptedConnector, ScriptedResponse, TimelineEntry};
use kubedeploy::{ActionStatus, ActionType, ClusterConfig, EngineConfig, NodeConfig, Role, TaskStatus};

fn engine(dir: &Path) -> EngineConfig {
    EngineConfig {
        log_dir: dir.to_path_buf(),
        ..EngineConfig::development()
    }
}

fn nodes() -> Vec<NodeConfig> {
    vec![
        NodeConfig::new("n1", "10.0.0.1").with_roles([Role::Etcd, Role::Master]),
        NodeConfig::new("n2", "10.0.0.2").with_roles([Role::Etcd, Role::Master]),
        NodeConfig::new("n3", "10.0.0.3").with_roles([Role::Etcd, Role::Worker]),
        NodeConfig::new("w1", "10.0.0.4").with_roles([Role::Worker]),
        NodeConfig::new("i1", "10.0.0.5").with_roles([Role::Ingress]),
    ]
}

/// Fresh machines: nothing joined, no admin kubeconfig yet
fn fresh_connector() -> ScriptedConnector {
    let connector = ScriptedConnector::new();
    connector.respond(None, "test -f /etc/kubernetes/", ScriptedResponse::exit(1, ""));
    connector
}

fn deploy(connector: &ScriptedConnector, dir: &Path) -> Controller {
    let controller = Controller::with_connector(Arc::new(connector.clone()), engine(dir)).unwrap();
    let reply = controller.deploy(DeployRequest {
        cluster: ClusterConfig::new("prod"),
        nodes: nodes(),
    });
    assert!(reply.accepted, "{reply:?}");
    assert_eq!(reply.task.as_deref(), Some("prod"));
    controller
}

fn matching<'a>(timeline: &'a [TimelineEntry], needle: &'a str) -> impl Iterator<Item = &'a TimelineEntry> + 'a {
    timeline.iter().filter(move |entry| entry.operation.contains(needle))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_deploy_runs_bands_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let connector = fresh_connector();
    connector.respond(
        None,
        "endpoint health",
        ScriptedResponse::ok("healthy").with_delay(Duration::from_millis(30)),
    );
    let controller = deploy(&connector, dir.path());
    assert_eq!(controller.wait("prod").await.unwrap(), TaskStatus::Done);

    let timeline = connector.timeline();
    let last_init = matching(&timeline, "hostnamectl").map(|e| e.finished_at).max().unwrap();
    let first_etcd = matching(&timeline, "mkdir -p /etc/etcd/pki").map(|e| e.started_at).min().unwrap();
    let last_health = matching(&timeline, "endpoint health").map(|e| e.finished_at).max().unwrap();
    let kubeadm_init = matching(&timeline, "kubeadm init").next().unwrap();
    let control_plane_join = matching(&timeline, "--control-plane").next().unwrap();
    let worker_joins: Vec<_> = matching(&timeline, "kubeadm join")
        .filter(|e| !e.operation.contains("--control-plane"))
        .collect();

    assert!(last_init <= first_etcd);
    assert!(last_health <= kubeadm_init.started_at);
    assert_eq!(kubeadm_init.node, "n1");
    assert_eq!(control_plane_join.node, "n2");
    assert!(kubeadm_init.finished_at <= control_plane_join.started_at);
    assert_eq!(worker_joins.len(), 3, "n3, w1 and the ingress node join as workers");
    for join in &worker_joins {
        assert!(control_plane_join.finished_at <= join.started_at);
    }

    let report = controller
        .get_result(&ResultRequest {
            task: "prod".to_string(),
            stage: None,
        })
        .unwrap();
    assert_eq!(report.status, TaskStatus::Done);
    assert!(report.error.is_none());
    assert_eq!(report.summary.total, 15);
    assert_eq!(report.summary.done, 15);
    assert!(report.records.iter().all(|r| r.status == ActionStatus::Done));

    let ingress = controller
        .get_result(&ResultRequest {
            task: "prod".to_string(),
            stage: Some(Stage::Ingress),
        })
        .unwrap();
    let types: Vec<_> = ingress.records.iter().map(|r| r.action_type).collect();
    assert_eq!(types, vec![ActionType::DeployIngress, ActionType::DeployContour]);
    assert_eq!(ingress.records[1].node_name, None);
}

#[tokio::test]
async fn test_etcd_certificates_reach_the_first_master() {
    let dir = tempfile::tempdir().unwrap();
    let connector = fresh_connector();
    let controller = deploy(&connector, dir.path());
    assert_eq!(controller.wait("prod").await.unwrap(), TaskStatus::Done);

    let ca_on_etcd = connector.uploaded("n1", "/etc/etcd/pki/ca.crt").unwrap();
    let ca_on_n3 = connector.uploaded("n3", "/etc/etcd/pki/ca.crt").unwrap();
    let ca_on_master = connector.uploaded("n1", "/etc/kubernetes/pki/etcd/ca.crt").unwrap();
    assert_eq!(ca_on_etcd, ca_on_n3);
    assert_eq!(ca_on_etcd, ca_on_master);
    assert!(String::from_utf8(ca_on_master).unwrap().contains("BEGIN CERTIFICATE"));

    let kubeadm_config = connector.uploaded("n1", "/etc/kubernetes/kubeadm-config.yaml").unwrap();
    let kubeadm_config = String::from_utf8(kubeadm_config).unwrap();
    assert!(kubeadm_config.contains("https://10.0.0.3:2379"));
}

#[tokio::test]
async fn test_ingress_failure_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let connector = fresh_connector();
    connector.respond(None, "contour.yaml", ScriptedResponse::exit(1, "no route to host"));
    let controller = deploy(&connector, dir.path());

    assert_eq!(controller.wait("prod").await.unwrap(), TaskStatus::Done);

    let root = controller.store().get_task("prod").unwrap();
    let ingress = root.find("ingress").unwrap();
    assert_eq!(ingress.status(), TaskStatus::Failed);
    assert!(root.error().is_none());

    let records = controller
        .get_result(&ResultRequest {
            task: "prod".to_string(),
            stage: Some(Stage::Ingress),
        })
        .unwrap()
        .records;
    let contour = records.iter().find(|r| r.action_type == ActionType::DeployContour).unwrap();
    assert_eq!(contour.status, ActionStatus::Failed);
    let error = contour.error.as_ref().unwrap();
    assert_eq!(error.reason, "command failed");
    assert!(error.detail.contains("no route to host"));
}

#[tokio::test]
async fn test_etcd_failure_stops_later_bands() {
    let dir = tempfile::tempdir().unwrap();
    let connector = fresh_connector();
    connector.respond(Some("n2"), "docker run etcd", ScriptedResponse::exit(125, "port is already allocated"));
    let controller = deploy(&connector, dir.path());

    assert_eq!(controller.wait("prod").await.unwrap(), TaskStatus::Failed);

    let root = controller.store().get_task("prod").unwrap();
    let error = root.error().unwrap();
    assert_eq!(error.reason, "items failed");
    assert!(error.detail.contains("etcd"));

    assert_eq!(root.find("etcd").unwrap().status(), TaskStatus::Failed);
    for later in ["master", "worker", "ingress"] {
        let task = root.find(later).unwrap();
        assert_eq!(task.status(), TaskStatus::Pending, "{later}");
        assert!(!task.has_children(), "{later} must not be split");
    }
    assert!(connector.timeline().iter().all(|e| !e.operation.contains("kubeadm")));

    let etcd = controller
        .get_result(&ResultRequest {
            task: "prod".to_string(),
            stage: Some(Stage::Etcd),
        })
        .unwrap()
        .records;
    let failed: Vec<_> = etcd
        .iter()
        .filter(|r| r.status == ActionStatus::Failed)
        .map(|r| r.node_name.clone().unwrap())
        .collect();
    assert_eq!(failed, vec!["n2".to_string()]);
}

#[tokio::test]
async fn test_logs_by_node_and_stage() {
    let dir = tempfile::tempdir().unwrap();
    let connector = fresh_connector();
    let controller = deploy(&connector, dir.path());
    controller.wait("prod").await.unwrap();

    let etcd_log = controller
        .get_log(&LogRequest {
            task: "prod".to_string(),
            node: "n1".to_string(),
            stage: Some(Stage::Etcd),
        })
        .await
        .unwrap();
    assert!(etcd_log.contains("endpoint health"));
    assert!(!etcd_log.contains("kubeadm"));

    let all = controller
        .get_log(&LogRequest {
            task: "prod".to_string(),
            node: "n1".to_string(),
            stage: None,
        })
        .await
        .unwrap();
    assert!(all.contains("hostnamectl set-hostname n1"));
    assert!(all.contains("kubeadm init"));

    let nothing = controller
        .get_log(&LogRequest {
            task: "prod".to_string(),
            node: "w1".to_string(),
            stage: Some(Stage::Etcd),
        })
        .await
        .unwrap();
    assert!(nothing.is_empty());
}
