//! Status write-back helpers: condition bookkeeping and the deployment status body.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use kanso_core::{KansoError, ResourceKind};
use kanso_persist::DeploymentTarget;
use kanso_schema::{
    ApiObject, Condition, HealthStatus, HealthStatusCode, ResourceStatus, SyncStatus, SyncStatusCode,
    CONDITION_CONNECTION_READY, CONDITION_ERROR_OCCURRED,
};

pub(crate) const REASON_OPERATION_FAILED: &str = "OperationFailed";

fn flag(ok: bool) -> String {
    if ok { "True" } else { "False" }.to_string()
}

pub(crate) fn condition(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: flag(status),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: None,
    }
}

/// `ErrorOccurred=False` after a clean pass.
pub(crate) fn no_error() -> Condition {
    condition(CONDITION_ERROR_OCCURRED, false, "", "")
}

pub(crate) fn error_occurred(reason: &str, message: impl Into<String>) -> Condition {
    condition(CONDITION_ERROR_OCCURRED, true, reason, message)
}

/// Conditions raised for a permanent failure of `kind`.
pub(crate) fn failure_conditions(kind: ResourceKind, err: &KansoError) -> Vec<Condition> {
    let mut out = vec![error_occurred(err.reason(), err.to_string())];
    if kind == ResourceKind::ManagedEnvironment {
        out.push(condition(CONDITION_CONNECTION_READY, false, err.reason(), err.to_string()));
    }
    out
}

pub(crate) fn existing_conditions(obj: &ApiObject) -> Vec<Condition> {
    let found = match obj {
        ApiObject::Deployment(o) => o.status.as_ref().map(|s| &s.conditions),
        ApiObject::ManagedEnvironment(o) => o.status.as_ref().map(|s| &s.conditions),
        ApiObject::RepositoryCredential(o) => o.status.as_ref().map(|s| &s.conditions),
        ApiObject::SyncRun(o) => o.status.as_ref().map(|s| &s.conditions),
    };
    found.cloned().unwrap_or_default()
}

/// Upserts `updates` by type. The transition time only moves when a
/// condition's status actually flips.
pub(crate) fn merge_conditions(existing: &[Condition], updates: Vec<Condition>) -> Vec<Condition> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut out = existing.to_vec();
    for mut next in updates {
        match out.iter_mut().find(|c| c.type_ == next.type_) {
            Some(cur) => {
                next.last_transition_time = if cur.status == next.status {
                    cur.last_transition_time.clone()
                } else {
                    Some(now.clone())
                };
                *cur = next;
            }
            None => {
                next.last_transition_time = Some(now.clone());
                out.push(next);
            }
        }
    }
    out
}

pub(crate) fn to_value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

pub(crate) fn sync_code(row: &DeploymentTarget) -> SyncStatusCode {
    if !row.last_failure.is_empty() || (row.synced_generation > 0 && row.generation > row.synced_generation) {
        SyncStatusCode::OutOfSync
    } else if row.synced_generation == 0 {
        SyncStatusCode::Unknown
    } else {
        SyncStatusCode::Synced
    }
}

pub(crate) fn resources(row: &DeploymentTarget) -> Vec<ResourceStatus> {
    match serde_json::from_str(&row.resources_json) {
        Ok(v) => v,
        Err(e) => {
            warn!(entity = %row.id, error = %e, "unreadable resource summary; reporting none");
            Vec::new()
        }
    }
}

/// Status body of a GitOpsDeployment from its entity row.
pub(crate) fn deployment_status(row: &DeploymentTarget, operation_id: Option<&str>) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("sync".into(), to_value(&SyncStatus { status: sync_code(row), revision: row.sync_revision.clone() }));
    m.insert(
        "health".into(),
        to_value(&HealthStatus { status: HealthStatusCode::parse(&row.health), message: row.health_message.clone() }),
    );
    m.insert("resources".into(), to_value(&resources(row)));
    m.insert("operationID".into(), operation_id.map(|id| Value::String(id.to_string())).unwrap_or(Value::Null));
    m
}
