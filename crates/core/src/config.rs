//! Runtime settings read from `KANSO_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub db_path: String,
    /// Namespace owned by the external engine: Operation objects and credential artifacts live here.
    pub engine_namespace: String,
    /// Restrict notifiers to one namespace (None = all).
    pub watch_namespace: Option<String>,
    pub max_workers: usize,
    pub queue_depth: usize,
    pub coalesce: bool,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_attempts: u32,
    pub op_timeout_secs: u64,
    pub op_poll_ms: u64,
    pub refresh_secs: u64,
    pub gc_interval_secs: u64,
    pub dead_letter_cap: usize,
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            engine_namespace: "gitops-engine".to_string(),
            watch_namespace: None,
            max_workers: 16,
            queue_depth: 8,
            coalesce: true,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
            max_attempts: 12,
            op_timeout_secs: 30,
            op_poll_ms: 500,
            refresh_secs: 5,
            gc_interval_secs: 300,
            dead_letter_cap: 256,
            metrics_addr: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(s) => match s.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %s, "ignoring unparsable setting");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            db_path: std::env::var("KANSO_DB_PATH").unwrap_or(d.db_path),
            engine_namespace: std::env::var("KANSO_ENGINE_NAMESPACE").unwrap_or(d.engine_namespace),
            watch_namespace: std::env::var("KANSO_WATCH_NAMESPACE").ok().filter(|s| !s.is_empty()),
            max_workers: env_or("KANSO_MAX_WORKERS", d.max_workers).max(1),
            queue_depth: env_or("KANSO_QUEUE_DEPTH", d.queue_depth).max(1),
            coalesce: env_flag("KANSO_COALESCE", d.coalesce),
            backoff_base_ms: env_or("KANSO_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_max_ms: env_or("KANSO_BACKOFF_MAX_MS", d.backoff_max_ms),
            max_attempts: env_or("KANSO_MAX_ATTEMPTS", d.max_attempts),
            op_timeout_secs: env_or("KANSO_OP_TIMEOUT_SECS", d.op_timeout_secs),
            op_poll_ms: env_or("KANSO_OP_POLL_MS", d.op_poll_ms).max(10),
            refresh_secs: env_or("KANSO_REFRESH_SECS", d.refresh_secs),
            gc_interval_secs: env_or("KANSO_GC_INTERVAL_SECS", d.gc_interval_secs),
            dead_letter_cap: env_or("KANSO_DEAD_LETTER_CAP", d.dead_letter_cap),
            metrics_addr: std::env::var("KANSO_METRICS_ADDR").ok(),
        }
    }

    pub fn backoff_base(&self) -> Duration { Duration::from_millis(self.backoff_base_ms) }
    pub fn backoff_max(&self) -> Duration { Duration::from_millis(self.backoff_max_ms) }
    pub fn op_timeout(&self) -> Duration { Duration::from_secs(self.op_timeout_secs) }
    pub fn op_poll(&self) -> Duration { Duration::from_millis(self.op_poll_ms) }
    pub fn refresh_delay(&self) -> Duration { Duration::from_secs(self.refresh_secs) }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kanso");
        p.push("kanso.db");
        return p.to_string_lossy().to_string();
    }
    "kanso.db".to_string()
}
