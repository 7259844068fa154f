//! Notifier shims: list+watch per kind, translated into raw change
//! notifications for the normalizer. No business logic lives here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use kanso_core::error::backoff_delay;
use kanso_core::{ChangeKind, EventSink, ObjectRequest, ResourceKey, ResourceKind, SecretIndex};

const REDELIVERY_BASE: Duration = Duration::from_millis(250);
const REDELIVERY_MAX: Duration = Duration::from_secs(30);
/// Attempts per parked object before its notifications are given up on.
pub const REDELIVERY_ATTEMPTS: u32 = 16;

/// Tracks which UIDs a watch has reported so far, so that plain watch
/// events can be told apart as creations, modifications and deletions.
#[derive(Debug, Default)]
pub struct Sightings {
    seen: FxHashMap<String, ObjectRequest>,
}

impl Sightings {
    pub fn applied(&mut self, uid: &str, req: ObjectRequest) -> ChangeKind {
        match self.seen.insert(uid.to_string(), req) {
            None => ChangeKind::Created,
            Some(_) => ChangeKind::Modified,
        }
    }

    pub fn deleted(&mut self, uid: &str) -> ChangeKind {
        self.seen.remove(uid);
        ChangeKind::Deleted
    }

    /// Reconciles the seen set with a fresh list. Objects that vanished while
    /// the watch was down are reported as deleted first.
    pub fn restarted(&mut self, live: Vec<(String, ObjectRequest)>) -> Vec<(ObjectRequest, ChangeKind)> {
        let mut out = Vec::with_capacity(live.len());
        let live_uids: rustc_hash::FxHashSet<&str> = live.iter().map(|(uid, _)| uid.as_str()).collect();
        let mut gone: Vec<(String, ObjectRequest)> = self
            .seen
            .iter()
            .filter(|(uid, _)| !live_uids.contains(uid.as_str()))
            .map(|(uid, req)| (uid.clone(), req.clone()))
            .collect();
        gone.sort_by(|a, b| (&a.1.namespace, &a.1.name).cmp(&(&b.1.namespace, &b.1.name)));
        for (uid, req) in gone {
            self.seen.remove(&uid);
            out.push((req, ChangeKind::Deleted));
        }
        for (uid, req) in live {
            let change = self.applied(&uid, req.clone());
            out.push((req, change));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn request_of<K: Resource>(obj: &K) -> Option<(String, ObjectRequest)> {
    let uid = obj.meta().uid.clone()?;
    let ns = obj.meta().namespace.clone()?;
    Some((uid, ObjectRequest::new(ns, obj.name_any())))
}

#[derive(Debug)]
struct Parked {
    changes: VecDeque<ChangeKind>,
    attempt: u32,
    due: Instant,
}

/// Notifications the sink refused with a retryable error (typically a
/// namespace the tenant cache has not seen yet). They are held per object
/// and redelivered with backoff; later changes to a parked object queue
/// behind it so per-object order survives.
#[derive(Debug, Default)]
pub struct Redelivery {
    parked: FxHashMap<ResourceKey, Parked>,
}

impl Redelivery {
    /// Delivers one notification now, or parks it behind earlier ones for the same object.
    pub fn offer(&mut self, sink: &dyn EventSink, kind: ResourceKind, req: &ObjectRequest, change: ChangeKind, now: Instant) {
        counter!("kubehub_notifications_total", 1u64);
        let key = ResourceKey::new(kind, req.namespace.clone(), req.name.clone());
        if let Some(p) = self.parked.get_mut(&key) {
            debug!(key = %key, ?change, "object has parked notifications; queued behind them");
            p.changes.push_back(change);
            return;
        }
        match sink.receive(req, kind, change) {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                counter!("kubehub_notifications_parked_total", 1u64);
                warn!(key = %key, ?change, error = %e, "notification rejected; will redeliver");
                self.parked.insert(
                    key,
                    Parked { changes: VecDeque::from([change]), attempt: 1, due: now + backoff_delay(1, REDELIVERY_BASE, REDELIVERY_MAX) },
                );
            }
            Err(e) => {
                counter!("kubehub_notifications_dropped_total", 1u64);
                error!(key = %key, ?change, error = %e, "notification rejected permanently");
            }
        }
    }

    /// Retries every parked object whose backoff has elapsed. Returns the
    /// number of notifications delivered.
    pub fn flush(&mut self, sink: &dyn EventSink, now: Instant) -> usize {
        let mut delivered = 0;
        let due: Vec<ResourceKey> = self.parked.iter().filter(|(_, p)| p.due <= now).map(|(k, _)| k.clone()).collect();
        for key in due {
            let Some(mut p) = self.parked.remove(&key) else { continue };
            let req = ObjectRequest::new(key.namespace.clone(), key.name.clone());
            let mut progressed = false;
            let mut failure = None;
            while let Some(change) = p.changes.front().copied() {
                match sink.receive(&req, key.kind, change) {
                    Ok(()) => {
                        p.changes.pop_front();
                        delivered += 1;
                        progressed = true;
                    }
                    Err(e) if e.is_retryable() => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => {
                        counter!("kubehub_notifications_dropped_total", 1u64);
                        error!(key = %key, ?change, error = %e, "notification rejected permanently");
                        p.changes.pop_front();
                    }
                }
            }
            let Some(e) = failure else {
                debug!(key = %key, "parked notifications delivered");
                continue;
            };
            p.attempt = if progressed { 1 } else { p.attempt + 1 };
            if p.attempt > REDELIVERY_ATTEMPTS {
                counter!("kubehub_notifications_dropped_total", p.changes.len() as u64);
                error!(key = %key, pending = p.changes.len(), error = %e, "giving up on parked notifications");
                continue;
            }
            p.due = now + backoff_delay(p.attempt, REDELIVERY_BASE, REDELIVERY_MAX);
            debug!(key = %key, attempt = p.attempt, error = %e, "redelivery failed; backing off");
            self.parked.insert(key, p);
        }
        delivered
    }

    /// When the earliest parked object becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.parked.values().map(|p| p.due).min()
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

async fn redelivery_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Watches one custom resource kind and forwards every change to `sink`.
/// Runs until the watch stream ends.
pub async fn start_notifier<K>(client: Client, kind: ResourceKind, namespace: Option<String>, sink: Arc<dyn EventSink>) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + 'static,
{
    let api: Api<K> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "notifier started");
    let mut sightings = Sightings::default();
    let mut retry = Redelivery::default();
    loop {
        let ev = tokio::select! {
            ev = stream.next() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = redelivery_due(retry.next_due()) => {
                retry.flush(sink.as_ref(), Instant::now());
                continue;
            }
        };
        let now = Instant::now();
        match ev {
            Ok(Event::Applied(o)) => {
                if let Some((uid, req)) = request_of(&o) {
                    let change = sightings.applied(&uid, req.clone());
                    retry.offer(sink.as_ref(), kind, &req, change, now);
                }
            }
            Ok(Event::Deleted(o)) => {
                if let Some((uid, req)) = request_of(&o) {
                    let change = sightings.deleted(&uid);
                    retry.offer(sink.as_ref(), kind, &req, change, now);
                }
            }
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                let live = list.iter().filter_map(request_of).collect();
                for (req, change) in sightings.restarted(live) {
                    retry.offer(sink.as_ref(), kind, &req, change, now);
                }
            }
            Err(e) => warn!(kind = %kind, error = %e, "watch error; backing off"),
        }
    }
    warn!(kind = %kind, "notifier stream ended");
    Ok(())
}

/// Watches Secrets and re-queues every ManagedEnvironment and
/// RepositoryCredential that references a changed or deleted secret.
pub async fn start_secret_watcher(
    client: Client,
    namespace: Option<String>,
    index: Arc<dyn SecretIndex>,
    sink: Arc<dyn EventSink>,
) -> Result<()> {
    let api: Api<Secret> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "secret watcher started");
    let mut sightings = Sightings::default();
    let mut retry = Redelivery::default();
    loop {
        let ev = tokio::select! {
            ev = stream.next() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = redelivery_due(retry.next_due()) => {
                retry.flush(sink.as_ref(), Instant::now());
                continue;
            }
        };
        let touched: Vec<ObjectRequest> = match ev {
            Ok(Event::Applied(s)) => request_of(&s)
                .map(|(uid, req)| {
                    sightings.applied(&uid, req.clone());
                    vec![req]
                })
                .unwrap_or_default(),
            Ok(Event::Deleted(s)) => request_of(&s)
                .map(|(uid, req)| {
                    sightings.deleted(&uid);
                    vec![req]
                })
                .unwrap_or_default(),
            Ok(Event::Restarted(list)) => {
                let live = list.iter().filter_map(request_of).collect();
                sightings.restarted(live).into_iter().map(|(req, _)| req).collect()
            }
            Err(e) => {
                warn!(error = %e, "secret watch error; backing off");
                Vec::new()
            }
        };
        for secret in touched {
            let keys = match index.referencing(&secret.namespace, &secret.name) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(ns = %secret.namespace, secret = %secret.name, error = %e, "secret index lookup failed");
                    continue;
                }
            };
            for key in keys {
                debug!(key = %key, secret = %secret.name, "secret change fan-out");
                retry.offer(sink.as_ref(), key.kind, &ObjectRequest::new(key.namespace, key.name), ChangeKind::Modified, Instant::now());
            }
        }
    }
    warn!("secret watcher stream ended");
    Ok(())
}
