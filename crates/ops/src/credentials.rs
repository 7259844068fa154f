//! Credential artifacts: engine-scoped secrets derived from a user's source
//! secret. Names are derived from the entity id, so regeneration overwrites
//! in place and cleanup never needs a lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use kanso_core::{KansoError, KansoResult};
use kanso_kubehub::Cluster;
use kanso_schema::KUBECONFIG_KEY;

pub const LABEL_SECRET_TYPE: &str = "kanso.dev/secret-type";
pub const LABEL_MANAGED_ENVIRONMENT: &str = "kanso.dev/managed-environment";
/// Fingerprint of the material an artifact was written from.
pub const ANNOTATION_FINGERPRINT: &str = "kanso.dev/credential-fingerprint";

/// Hex SHA-256 over the parts. Each part is length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

fn secret_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).map(|s| s.as_bytes()))
        .filter(|v| !v.is_empty())
}

fn secret_name(secret: &Secret) -> &str {
    secret.metadata.name.as_deref().unwrap_or_default()
}

/// Connection material read from a cluster-registration source secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCredential {
    pub kubeconfig: String,
    pub fingerprint: String,
}

pub fn credential_material(secret: &Secret) -> KansoResult<SourceCredential> {
    let raw = secret_value(secret, KUBECONFIG_KEY).ok_or_else(|| {
        KansoError::Validation(format!("secret '{}' has no '{KUBECONFIG_KEY}' key", secret_name(secret)))
    })?;
    let kubeconfig = std::str::from_utf8(raw)
        .map_err(|_| KansoError::Validation(format!("secret '{}' holds a non UTF-8 kubeconfig", secret_name(secret))))?
        .to_string();
    Ok(SourceCredential { fingerprint: fingerprint(&[raw]), kubeconfig })
}

/// Fingerprint of repository credentials: either `username` + `password`,
/// or `sshPrivateKey`.
pub fn repository_material(secret: &Secret) -> KansoResult<String> {
    if let Some(key) = secret_value(secret, "sshPrivateKey") {
        return Ok(fingerprint(&[b"ssh", key]));
    }
    match (secret_value(secret, "username"), secret_value(secret, "password")) {
        (Some(user), Some(pass)) => Ok(fingerprint(&[b"basic", user, pass])),
        _ => Err(KansoError::Validation(format!(
            "secret '{}' needs username and password, or sshPrivateKey",
            secret_name(secret)
        ))),
    }
}

/// Creates, regenerates and deletes credential artifacts in the engine namespace.
pub struct CredentialManager {
    cluster: Arc<dyn Cluster>,
    namespace: String,
}

impl CredentialManager {
    pub fn new(cluster: Arc<dyn Cluster>, namespace: impl Into<String>) -> Self {
        Self { cluster, namespace: namespace.into() }
    }

    pub fn artifact_name(env_id: &str) -> String {
        format!("managed-env-{env_id}")
    }

    /// Reads the referenced secret from the tenant namespace. A missing
    /// secret is a permanent `MissingReference`.
    pub async fn read_source(&self, namespace: &str, name: &str) -> KansoResult<Secret> {
        self.cluster
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| KansoError::missing("Secret", format!("{namespace}/{name}")))
    }

    fn artifact(&self, env_id: &str, display_name: &str, api_url: &str, material: &SourceCredential) -> Secret {
        let labels = BTreeMap::from([
            (LABEL_SECRET_TYPE.to_string(), "cluster".to_string()),
            (LABEL_MANAGED_ENVIRONMENT.to_string(), env_id.to_string()),
        ]);
        let data = BTreeMap::from([
            ("name".to_string(), ByteString(display_name.as_bytes().to_vec())),
            ("server".to_string(), ByteString(api_url.as_bytes().to_vec())),
            ("config".to_string(), ByteString(material.kubeconfig.as_bytes().to_vec())),
        ]);
        Secret {
            metadata: ObjectMeta {
                name: Some(Self::artifact_name(env_id)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(ANNOTATION_FINGERPRINT.to_string(), material.fingerprint.clone())])),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Writes the artifact for `env_id`, replacing any earlier version.
    pub async fn ensure_artifact(&self, env_id: &str, display_name: &str, api_url: &str, material: &SourceCredential) -> KansoResult<()> {
        let secret = self.artifact(env_id, display_name, api_url, material);
        self.cluster.apply_secret(&self.namespace, secret).await?;
        info!(env = env_id, fingerprint = %material.fingerprint, "credential artifact written");
        Ok(())
    }

    /// Deletes the artifact; deleting one that is already gone is fine.
    pub async fn delete_artifact(&self, env_id: &str) -> KansoResult<bool> {
        let existed = self.cluster.delete_secret(&self.namespace, &Self::artifact_name(env_id)).await?;
        if existed {
            info!(env = env_id, "credential artifact deleted");
        } else {
            debug!(env = env_id, "credential artifact already absent");
        }
        Ok(existed)
    }

    pub async fn artifact_exists(&self, env_id: &str) -> KansoResult<bool> {
        Ok(self.cluster.get_secret(&self.namespace, &Self::artifact_name(env_id)).await?.is_some())
    }

    /// True when the artifact exists and was written for this API URL from this material.
    pub async fn artifact_current(&self, env_id: &str, api_url: &str, material: &SourceCredential) -> KansoResult<bool> {
        let Some(artifact) = self.cluster.get_secret(&self.namespace, &Self::artifact_name(env_id)).await? else {
            return Ok(false);
        };
        let written_from = artifact.metadata.annotations.as_ref().and_then(|a| a.get(ANNOTATION_FINGERPRINT));
        Ok(written_from == Some(&material.fingerprint) && secret_value(&artifact, "server") == Some(api_url.as_bytes()))
    }
}
