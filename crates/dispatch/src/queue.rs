use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use kanso_core::{CanonicalEvent, ChangeKind};

/// Pending events of one resource key, in arrival order.
pub(crate) struct KeyQueue {
    pending: VecDeque<CanonicalEvent>,
    /// Handed to the worker of the current event; cancelled by a newer `Deleted`.
    wait: CancellationToken,
    parent: CancellationToken,
}

impl KeyQueue {
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self { pending: VecDeque::new(), wait: parent.child_token(), parent: parent.clone() }
    }

    /// Appends an event. Once `depth` events are pending, the oldest pending
    /// `Modified` is dropped in favour of the new one; returns true when that happened.
    /// `Created` and `Deleted` are never dropped.
    pub(crate) fn push(&mut self, ev: CanonicalEvent, depth: usize, coalesce: bool) -> bool {
        let mut coalesced = false;
        if ev.change == ChangeKind::Deleted {
            self.wait.cancel();
            self.wait = self.parent.child_token();
        }
        if coalesce && self.pending.len() >= depth {
            if let Some(pos) = self.pending.iter().position(|p| p.change == ChangeKind::Modified) {
                self.pending.remove(pos);
                coalesced = true;
            }
        }
        self.pending.push_back(ev);
        coalesced
    }

    /// Puts a failed event back at the head so nothing later overtakes it.
    pub(crate) fn push_front(&mut self, ev: CanonicalEvent) {
        self.pending.push_front(ev);
    }

    pub(crate) fn pop(&mut self) -> Option<(CanonicalEvent, CancellationToken)> {
        self.pending.pop_front().map(|ev| (ev, self.wait.clone()))
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
