//! Spec validation. Every failure here is permanent: it is surfaced on the
//! object's status and only a new spec change re-attempts reconciliation.

use std::sync::LazyLock;

use regex::Regex;

use kanso_core::{KansoError, KansoResult};

use crate::{
    GitOpsDeploymentManagedEnvironmentSpec, GitOpsDeploymentRepositoryCredentialSpec, GitOpsDeploymentSpec,
    GitOpsDeploymentSyncRunSpec,
};

/// RFC 1123 label (namespace and object references).
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Accepts http(s)://, ssh:// and scp-like git@host:path repository URLs.
static REPO_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((https?|ssh)://[^\s/]+(/\S*)?|git@[^\s:]+:\S+)$").expect("static regex"));

fn invalid(msg: impl Into<String>) -> KansoError {
    KansoError::Validation(msg.into())
}

pub fn validate_name(field: &str, value: &str) -> KansoResult<()> {
    if value.is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value.len() > 63 {
        return Err(invalid(format!("{field} exceeds 63 characters")));
    }
    if !NAME_REGEX.is_match(value) {
        return Err(invalid(format!("{field} '{value}' is not a valid Kubernetes name (RFC 1123)")));
    }
    Ok(())
}

pub fn validate_repo_url(value: &str) -> KansoResult<()> {
    if !REPO_URL_REGEX.is_match(value) {
        return Err(invalid(format!("repository URL '{value}' must be http(s)://, ssh:// or git@host:path")));
    }
    Ok(())
}

pub fn deployment(spec: &GitOpsDeploymentSpec) -> KansoResult<()> {
    validate_repo_url(&spec.source.repo_url)?;
    if spec.source.path.starts_with('/') || spec.source.path.split('/').any(|s| s == "..") {
        return Err(invalid(format!("source path '{}' must be relative and stay inside the repository", spec.source.path)));
    }
    if !spec.destination.environment.is_empty() {
        validate_name("destination.environment", &spec.destination.environment)?;
    }
    if !spec.destination.namespace.is_empty() {
        validate_name("destination.namespace", &spec.destination.namespace)?;
    }
    Ok(())
}

pub fn managed_environment(spec: &GitOpsDeploymentManagedEnvironmentSpec) -> KansoResult<()> {
    if !spec.api_url.starts_with("https://") || spec.api_url.len() <= "https://".len() {
        return Err(invalid(format!("apiURL '{}' must be an https:// URL", spec.api_url)));
    }
    validate_name("credentialsSecret", &spec.credentials_secret)
}

pub fn repository_credential(spec: &GitOpsDeploymentRepositoryCredentialSpec) -> KansoResult<()> {
    validate_repo_url(&spec.repository)?;
    validate_name("secret", &spec.secret)
}

pub fn sync_run(spec: &GitOpsDeploymentSyncRunSpec) -> KansoResult<()> {
    validate_name("gitopsDeploymentName", &spec.gitops_deployment_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApplicationDestination, ApplicationSource, DeploymentType};

    fn dep(url: &str, path: &str) -> GitOpsDeploymentSpec {
        GitOpsDeploymentSpec {
            source: ApplicationSource { repo_url: url.into(), path: path.into(), target_revision: "main".into() },
            destination: ApplicationDestination::default(),
            type_: DeploymentType::Manual,
            sync_requested: false,
        }
    }

    #[test]
    fn accepts_common_repository_forms() {
        for url in [
            "https://github.com/acme/gitops",
            "http://gitea.local/acme/gitops.git",
            "ssh://git@github.com/acme/gitops.git",
            "git@github.com:acme/gitops.git",
        ] {
            assert!(validate_repo_url(url).is_ok(), "{url}");
        }
        for url in ["", "ftp://x/y", "github.com/acme", "https://"] {
            assert!(validate_repo_url(url).is_err(), "{url}");
        }
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(deployment(&dep("https://github.com/a/b", "env/dev")).is_ok());
        assert!(deployment(&dep("https://github.com/a/b", "/etc")).is_err());
        assert!(deployment(&dep("https://github.com/a/b", "env/../../x")).is_err());
    }

    #[test]
    fn destination_names_must_be_rfc1123() {
        let mut d = dep("https://github.com/a/b", "");
        d.destination.namespace = "Team_A".into();
        let err = deployment(&d).unwrap_err();
        assert_eq!(err.reason(), "InvalidSpec");
        d.destination.namespace = "team-a".into();
        d.destination.environment = "prod-east".into();
        assert!(deployment(&d).is_ok());
    }

    #[test]
    fn managed_environment_requires_https_and_secret() {
        let ok = GitOpsDeploymentManagedEnvironmentSpec { api_url: "https://10.0.0.1:6443".into(), credentials_secret: "env-creds".into() };
        assert!(managed_environment(&ok).is_ok());
        let plain = GitOpsDeploymentManagedEnvironmentSpec { api_url: "http://10.0.0.1".into(), ..ok.clone() };
        assert!(managed_environment(&plain).is_err());
        let no_secret = GitOpsDeploymentManagedEnvironmentSpec { credentials_secret: String::new(), ..ok };
        assert!(managed_environment(&no_secret).is_err());
    }

    #[test]
    fn sync_run_needs_a_deployment_name() {
        assert!(sync_run(&GitOpsDeploymentSyncRunSpec { gitops_deployment_name: String::new(), revision_id: String::new() }).is_err());
        assert!(sync_run(&GitOpsDeploymentSyncRunSpec { gitops_deployment_name: "web".into(), revision_id: "abc".into() }).is_ok());
    }
}
