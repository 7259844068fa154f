//! Kanso dispatch: turns raw change notifications into canonical events and
//! runs them through one ordered queue per resource key.
//!
//! Each key has at most one worker at a time; a key with nothing pending
//! holds no task and no permit.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use kanso_core::{CanonicalEvent, ErrorClass, KansoResult, Settings};

mod dispatcher;
mod normalizer;
mod queue;

pub use dispatcher::Dispatcher;
pub use normalizer::Normalizer;

/// What a handler asks the dispatcher to do once an event is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Re-queue a status-refresh event for the same key after the delay.
    Refresh(Duration),
}

/// Handle a worker holds while it owns a key. Cancelled when a `Deleted`
/// event arrives for the key or the dispatcher shuts down, so long waits
/// can step aside for the queued delete.
#[derive(Debug, Clone)]
pub struct KeyScope {
    cancel: CancellationToken,
}

impl KeyScope {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ev: &CanonicalEvent, scope: &KeyScope) -> KansoResult<Outcome>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    /// Pending events per key before `Modified` events are coalesced.
    pub queue_depth: usize,
    pub coalesce: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts before a transient failure is dead-lettered.
    pub max_attempts: u32,
    pub dead_letter_cap: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DispatcherConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            max_workers: s.max_workers.max(1),
            queue_depth: s.queue_depth.max(1),
            coalesce: s.coalesce,
            backoff_base: s.backoff_base(),
            backoff_max: s.backoff_max(),
            max_attempts: s.max_attempts.max(1),
            dead_letter_cap: s.dead_letter_cap,
        }
    }
}

/// An event the dispatcher gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: CanonicalEvent,
    pub error: String,
    pub class: ErrorClass,
    pub at: DateTime<Utc>,
}
