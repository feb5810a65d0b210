//! Status reconciliation and apply scenarios against an in-memory cluster.

mod common;

use common::{config_map, deployment, namespace, TestHarness};
use serde_json::json;

use kubedeploy::config::{ConfigLoader, KubernetesDeploySpec};
use kubedeploy::manifest::annotations::MANIFEST_HASH;
use kubedeploy::metadata::{self, metadata_name};
use kubedeploy::{ClusterApi, DeployEvent, DeployState, ResourceRef};

fn app_spec() -> KubernetesDeploySpec {
    KubernetesDeploySpec {
        manifests: vec![
            deployment("api", &["node", "index.js"]),
            config_map("api-config", json!({"LOG_LEVEL": "debug"})),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_second_deploy_is_idempotent() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());

    let first = harness.deployer.deploy(&action, false).await.unwrap();
    assert_eq!(first.apply.state, DeployState::Ready);
    assert_eq!(first.apply.updated_manifests.len(), 2);

    let applies = harness.cluster.apply_count();
    let second = harness.deployer.deploy(&action, false).await.unwrap();
    assert!(second.apply.updated_manifests.is_empty());
    assert_eq!(harness.cluster.apply_count(), applies);

    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Ready);
    assert_eq!(status.detail.mode, "default");
    assert_eq!(status.detail.version.as_deref(), Some(action.version.as_str()));
}

#[tokio::test]
async fn test_deleted_record_is_missing() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());
    harness.deployer.deploy(&action, false).await.unwrap();

    assert!(metadata::delete(harness.ctx().cluster(), "api", "default").await.unwrap());
    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Missing);
}

#[tokio::test]
async fn test_overwritten_version_is_outdated() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());
    harness.deployer.deploy(&action, false).await.unwrap();

    let record = ResourceRef::new("v1", "ConfigMap", Some("default"), metadata_name("api"));
    assert!(harness.cluster.set_data(&record, "resolvedVersion", "foo"));

    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Outdated);
}

#[tokio::test]
async fn test_invalid_hash_annotation_is_outdated() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());
    harness.deployer.deploy(&action, false).await.unwrap();

    let workload = ResourceRef::new("apps/v1", "Deployment", Some("default"), "api");
    assert!(harness.cluster.set_annotation(&workload, MANIFEST_HASH, "this is not a hash"));

    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Outdated);
    let resource = status
        .detail
        .resources
        .iter()
        .find(|r| r.key == "Deployment/api")
        .unwrap();
    assert_eq!(resource.state, DeployState::Outdated);
    assert_eq!(
        status
            .detail
            .resources
            .iter()
            .find(|r| r.key == "ConfigMap/api-config")
            .unwrap()
            .state,
        DeployState::Ready
    );
}

#[tokio::test]
async fn test_status_emits_one_namespace_event() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());
    let mut rx = harness.ctx().events.subscribe();

    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Missing);

    let mut namespace_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let DeployEvent::NamespaceStatus {
            namespace_name,
            state,
            ..
        } = event
        {
            assert_eq!(namespace_name, "default");
            assert_eq!(state, "ready");
            namespace_events += 1;
        }
    }
    assert_eq!(namespace_events, 1);
}

#[tokio::test]
async fn test_transient_errors_reach_the_caller() {
    let harness = TestHarness::new();
    let action = harness.action("api", app_spec());
    harness.deployer.deploy(&action, false).await.unwrap();

    harness.cluster.fail_next_reads(1);
    let err = harness.deployer.status(&action).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    let status = harness.deployer.status(&action).await.unwrap();
    assert_eq!(status.state, DeployState::Ready);
}

#[tokio::test]
async fn test_renamed_namespace_keeps_the_old_one() {
    let harness = TestHarness::new();

    let first = harness.action(
        "namespace-resource",
        KubernetesDeploySpec {
            manifests: vec![namespace("ns-1")],
            ..Default::default()
        },
    );
    harness.deployer.deploy(&first, false).await.unwrap();
    assert!(harness.cluster.contains("Namespace", None, "ns-1"));

    let renamed = harness.action(
        "namespace-resource",
        KubernetesDeploySpec {
            manifests: vec![namespace("ns-2")],
            ..Default::default()
        },
    );
    harness.deployer.deploy(&renamed, false).await.unwrap();
    assert!(harness.cluster.contains("Namespace", None, "ns-1"));
    assert!(harness.cluster.contains("Namespace", None, "ns-2"));

    let deleted = harness.deployer.delete(&renamed).await.unwrap();
    assert_eq!(deleted.deleted, vec!["Namespace/ns-2"]);
    assert!(harness.cluster.contains("Namespace", None, "ns-1"));
    assert!(!harness.cluster.contains("Namespace", None, "ns-2"));
}

#[tokio::test]
async fn test_deploy_from_loaded_config() {
    let harness = TestHarness::new();
    let config_dir = harness.temp_path().join("config");
    std::fs::create_dir_all(config_dir.join("manifests")).unwrap();
    std::fs::write(
        config_dir.join("provider.yaml"),
        "apiVersion: garden.io/v1\nkind: Provider\nmetadata:\n  name: kubernetes\nspec:\n  namespace: staging\n",
    )
    .unwrap();
    std::fs::write(
        config_dir.join("api.yaml"),
        "apiVersion: garden.io/v1\nkind: Deploy\nmetadata:\n  name: api\nspec:\n  files: [manifests/*.yaml]\n",
    )
    .unwrap();
    std::fs::write(
        config_dir.join("manifests/config.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: api-config\ndata:\n  a: \"1\"\n",
    )
    .unwrap();

    let loaded = ConfigLoader::new(&config_dir).load().unwrap();
    assert_eq!(loaded.provider.namespace, "staging");
    let action = loaded.deploy("api").unwrap();

    let outcome = harness.deployer.deploy(action, false).await.unwrap();
    assert_eq!(outcome.apply.updated_manifests, vec!["ConfigMap/api-config"]);

    let live = harness
        .cluster
        .get(&ResourceRef::new("v1", "ConfigMap", Some("default"), "api-config"))
        .await
        .unwrap()
        .unwrap();
    assert!(live.annotation(MANIFEST_HASH).is_some());
}
