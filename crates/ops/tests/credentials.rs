use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use kanso_kubehub::MemCluster;
use kanso_ops::{credential_material, CredentialManager};

const ENGINE: &str = "gitops-engine";

fn source(name: &str, kubeconfig: &str) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        data: Some(BTreeMap::from([("kubeconfig".to_string(), ByteString(kubeconfig.as_bytes().to_vec()))])),
        ..Default::default()
    }
}

#[tokio::test]
async fn artifact_lifecycle() {
    let cluster = Arc::new(MemCluster::new());
    cluster.put_secret("team-a", source("prod-creds", "cfg-v1")).unwrap();
    let creds = CredentialManager::new(cluster.clone(), ENGINE);

    let src = creds.read_source("team-a", "prod-creds").await.unwrap();
    let material = credential_material(&src).unwrap();
    creds.ensure_artifact("env-1", "prod", "https://10.0.0.1:6443", &material).await.unwrap();

    let name = CredentialManager::artifact_name("env-1");
    assert_eq!(name, "managed-env-env-1");
    let artifact = cluster.secret(ENGINE, &name).unwrap().unwrap();
    let labels = artifact.metadata.labels.clone().unwrap();
    assert_eq!(labels["kanso.dev/secret-type"], "cluster");
    assert_eq!(labels["kanso.dev/managed-environment"], "env-1");
    let data = artifact.data.unwrap();
    assert_eq!(data["server"].0, b"https://10.0.0.1:6443");
    assert_eq!(data["config"].0, b"cfg-v1");

    // regeneration overwrites in place
    cluster.put_secret("team-a", source("prod-creds", "cfg-v2")).unwrap();
    let rotated = credential_material(&creds.read_source("team-a", "prod-creds").await.unwrap()).unwrap();
    assert_ne!(rotated.fingerprint, material.fingerprint);
    creds.ensure_artifact("env-1", "prod", "https://10.0.0.1:6443", &rotated).await.unwrap();
    assert_eq!(cluster.secret_names(ENGINE).unwrap(), vec![name.clone()]);
    assert_eq!(cluster.secret(ENGINE, &name).unwrap().unwrap().data.unwrap()["config"].0, b"cfg-v2");

    assert!(creds.delete_artifact("env-1").await.unwrap());
    assert!(!creds.artifact_exists("env-1").await.unwrap());
    // second delete is a no-op
    assert!(!creds.delete_artifact("env-1").await.unwrap());
}

#[tokio::test]
async fn missing_source_secret_is_a_missing_reference() {
    let cluster = Arc::new(MemCluster::new());
    let creds = CredentialManager::new(cluster, ENGINE);
    let err = creds.read_source("team-a", "nope").await.unwrap_err();
    assert_eq!(err.reason(), "MissingReference");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn artifact_is_stale_after_rotation_or_server_change() {
    let cluster = Arc::new(MemCluster::new());
    cluster.put_secret("team-a", source("prod-creds", "cfg-v1")).unwrap();
    let creds = CredentialManager::new(cluster.clone(), ENGINE);
    let v1 = credential_material(&creds.read_source("team-a", "prod-creds").await.unwrap()).unwrap();

    assert!(!creds.artifact_current("env-1", "https://10.0.0.1:6443", &v1).await.unwrap());
    creds.ensure_artifact("env-1", "prod", "https://10.0.0.1:6443", &v1).await.unwrap();
    assert!(creds.artifact_current("env-1", "https://10.0.0.1:6443", &v1).await.unwrap());
    let artifact = cluster.secret(ENGINE, &CredentialManager::artifact_name("env-1")).unwrap().unwrap();
    assert_eq!(artifact.metadata.annotations.unwrap()["kanso.dev/credential-fingerprint"], v1.fingerprint);

    // a new API URL leaves the artifact stale
    assert!(!creds.artifact_current("env-1", "https://10.0.0.2:6443", &v1).await.unwrap());

    // so does rotated material
    cluster.put_secret("team-a", source("prod-creds", "cfg-v2")).unwrap();
    let v2 = credential_material(&creds.read_source("team-a", "prod-creds").await.unwrap()).unwrap();
    assert!(!creds.artifact_current("env-1", "https://10.0.0.1:6443", &v2).await.unwrap());
}
