use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use kanso_core::error::backoff_delay;
use kanso_core::{CanonicalEvent, ErrorClass, KansoError, KansoResult, ResourceKey};

use crate::queue::KeyQueue;
use crate::{DeadLetter, DispatcherConfig, Handler, KeyScope, Outcome};

/// Serializing dispatcher. Cheap to clone; all clones share one set of queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: DispatcherConfig,
    handler: Arc<dyn Handler>,
    keys: Mutex<FxHashMap<ResourceKey, KeyQueue>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
    dead: Mutex<VecDeque<DeadLetter>>,
    /// Keys with a live worker task plus scheduled refreshes.
    busy: watch::Sender<usize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking handler never holds these locks; recover the data
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Dispatcher {
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: DispatcherConfig, handler: Arc<dyn Handler>) -> Self {
        let (busy, _) = watch::channel(0usize);
        let inner = Inner {
            permits: Arc::new(Semaphore::new(cfg.max_workers)),
            cfg,
            handler,
            keys: Mutex::new(FxHashMap::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
            dead: Mutex::new(VecDeque::new()),
            busy,
        };
        info!(max_workers = inner.cfg.max_workers, depth = inner.cfg.queue_depth, "dispatcher started");
        Self { inner: Arc::new(inner) }
    }

    /// Places the event on its key's queue without waiting for processing.
    pub fn enqueue(&self, ev: CanonicalEvent) -> KansoResult<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(KansoError::Transient("dispatcher is shutting down".into()));
        }
        let key = ev.key();
        let mut keys = lock(&inner.keys);
        let spawn = !keys.contains_key(&key);
        let q = keys.entry(key.clone()).or_insert_with(|| KeyQueue::new(&inner.shutdown));
        debug!(key = %key, change = ?ev.change, attempt = ev.attempt, pending = q.len(), "enqueue");
        if q.push(ev, inner.cfg.queue_depth, inner.cfg.coalesce) {
            counter!("kanso_events_coalesced_total", 1u64);
        }
        if spawn {
            inner.busy.send_modify(|n| *n += 1);
            let me = Arc::clone(inner);
            inner.tracker.spawn_on(run_key(me, key), &inner.runtime);
        }
        Ok(())
    }

    /// Events waiting for `key`, excluding one being processed.
    pub fn pending(&self, key: &ResourceKey) -> usize {
        lock(&self.inner.keys).get(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn active_keys(&self) -> usize {
        lock(&self.inner.keys).len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.inner.dead).iter().cloned().collect()
    }

    /// Resolves once no key has pending work and no refresh is scheduled.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stops intake, interrupts waits and drains running tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(dead_letters = lock(&self.inner.dead).len(), "dispatcher stopped");
    }
}

impl Inner {
    fn dead_letter(&self, ev: CanonicalEvent, err: &KansoError) {
        counter!("kanso_events_dead_lettered_total", 1u64);
        error!(key = %ev.key(), change = ?ev.change, attempt = ev.attempt, error = %err, "event dead-lettered");
        let mut dead = lock(&self.dead);
        if self.cfg.dead_letter_cap == 0 {
            return;
        }
        while dead.len() >= self.cfg.dead_letter_cap {
            dead.pop_front();
        }
        dead.push_back(DeadLetter { event: ev, error: err.to_string(), class: err.class(), at: Utc::now() });
    }

    fn schedule_refresh(self: &Arc<Self>, ev: &CanonicalEvent, delay: std::time::Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.busy.send_modify(|n| *n += 1);
        let me = Arc::clone(self);
        let next = ev.refresh();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let d = Dispatcher { inner: Arc::clone(&me) };
                        if let Err(e) = d.enqueue(next) {
                            debug!(error = %e, "status refresh dropped");
                        }
                    }
                    _ = me.shutdown.cancelled() => {}
                }
                me.busy.send_modify(|n| *n = n.saturating_sub(1));
            },
            &self.runtime,
        );
    }
}

/// Drains one key's queue, one event at a time. Exits, releasing the key,
/// when the queue is empty.
async fn run_key(inner: Arc<Inner>, key: ResourceKey) {
    loop {
        let next = {
            let mut keys = lock(&inner.keys);
            let popped = keys.get_mut(&key).and_then(|q| q.pop());
            if popped.is_none() {
                keys.remove(&key);
            }
            popped
        };
        let Some((ev, token)) = next else { break };

        let permit = tokio::select! {
            p = Arc::clone(&inner.permits).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };
        let scope = KeyScope::new(token);
        let span = tracing::info_span!("reconcile", kind = %ev.kind, ns = %ev.namespace, name = %ev.name, change = ?ev.change, attempt = ev.attempt);
        let started = Instant::now();
        let result = inner.handler.handle(&ev, &scope).instrument(span).await;
        histogram!("kanso_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        drop(permit);

        match result {
            Ok(Outcome::Done) => {}
            Ok(Outcome::Refresh(delay)) => inner.schedule_refresh(&ev, delay),
            Err(e) => match e.class() {
                ErrorClass::Transient => {
                    let mut retry = ev;
                    retry.attempt += 1;
                    if retry.attempt >= inner.cfg.max_attempts {
                        inner.dead_letter(retry, &e);
                        continue;
                    }
                    counter!("kanso_events_retried_total", 1u64);
                    let delay = backoff_delay(retry.attempt, inner.cfg.backoff_base, inner.cfg.backoff_max);
                    warn!(key = %key, attempt = retry.attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient failure; retrying");
                    // the key stays held while backing off so nothing overtakes the retry
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = inner.shutdown.cancelled() => break,
                    }
                    let mut keys = lock(&inner.keys);
                    keys.entry(key.clone()).or_insert_with(|| KeyQueue::new(&inner.shutdown)).push_front(retry);
                }
                ErrorClass::Permanent => {
                    warn!(key = %key, error = %e, "event failed permanently");
                }
                ErrorClass::Fatal => inner.dead_letter(ev, &e),
            },
        }
    }
    if inner.shutdown.is_cancelled() {
        lock(&inner.keys).remove(&key);
    }
    inner.busy.send_modify(|n| *n = n.saturating_sub(1));
    debug!(key = %key, "key released");
}
