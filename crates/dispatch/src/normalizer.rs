use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use kanso_core::{
    CanonicalEvent, ChangeKind, EventSink, KansoError, KansoResult, ObjectRequest, ResourceKind, TenantResolver,
};

use crate::Dispatcher;

/// Front door for notifiers: resolves the tenant and hands a canonical event
/// to the dispatcher. Never touches the database or the network.
#[derive(Clone)]
pub struct Normalizer {
    tenants: Arc<dyn TenantResolver>,
    dispatcher: Dispatcher,
}

impl Normalizer {
    pub fn new(tenants: Arc<dyn TenantResolver>, dispatcher: Dispatcher) -> Self {
        Self { tenants, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl EventSink for Normalizer {
    fn receive(&self, req: &ObjectRequest, kind: ResourceKind, change: ChangeKind) -> KansoResult<()> {
        counter!("kanso_events_received_total", 1u64);
        let Some(tenant) = self.tenants.tenant_key(&req.namespace) else {
            warn!(kind = %kind, ns = %req.namespace, name = %req.name, "namespace not resolvable; event not enqueued");
            return Err(KansoError::NamespaceNotFound(req.namespace.clone()));
        };
        let ev = CanonicalEvent::new(kind, req, tenant, change);
        debug!(key = %ev.key(), change = ?change, tenant = %ev.tenant_key, "normalized");
        self.dispatcher.enqueue(ev)
    }
}
