//! Client-side working set of generation requests.
//!
//! [`ReconciliationStore`] mirrors whatever the server last reported and is
//! never authoritative. Every mutation returns a [`Reconciliation`] naming the
//! ids it touched, so a UI layer can refresh exactly those entries.
//!
//! Entries are held as `Arc`s. An incoming request that is structurally equal
//! to the stored one leaves the stored `Arc` in place, so consumers comparing
//! by pointer see no change.

use std::collections::HashMap;
use std::sync::Arc;

use atelier_core::generation::GenerationRequest;
use atelier_core::types::DbId;
use atelier_events::{GenerationEvent, GenerationEventKind};

/// Ids affected by one store mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub inserted: Vec<DbId>,
    pub replaced: Vec<DbId>,
    pub removed: Vec<DbId>,
}

impl Reconciliation {
    /// True when the mutation left the store untouched.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

/// Sequence number handed out when a fetch starts.
///
/// Only a ticket newer than the last applied one may write its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

#[derive(Debug, Default)]
pub struct ReconciliationStore {
    requests: HashMap<DbId, Arc<GenerationRequest>>,
    issued: u64,
    last_applied: Option<FetchTicket>,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, id: DbId) -> Option<&Arc<GenerationRequest>> {
        self.requests.get(&id)
    }

    /// Entries newest first (`created_at`, then id, descending).
    pub fn sorted(&self) -> Vec<Arc<GenerationRequest>> {
        let mut entries: Vec<_> = self.requests.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        entries
    }

    /// Merge `incoming` into the working set.
    ///
    /// Unknown ids are inserted. Known ids are replaced only when the incoming
    /// value differs. Entries not mentioned are left alone.
    pub fn set_requests(
        &mut self,
        incoming: impl IntoIterator<Item = GenerationRequest>,
    ) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        for request in incoming {
            let id = request.id;
            match self.requests.get(&id) {
                Some(current) if **current == request => {}
                Some(_) => {
                    self.requests.insert(id, Arc::new(request));
                    outcome.replaced.push(id);
                }
                None => {
                    self.requests.insert(id, Arc::new(request));
                    outcome.inserted.push(id);
                }
            }
        }
        outcome
    }

    /// Drop `id` from the working set. Missing ids are ignored.
    pub fn remove_request(&mut self, id: DbId) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        if self.requests.remove(&id).is_some() {
            outcome.removed.push(id);
        }
        outcome
    }

    /// Start a fetch. Tickets increase strictly.
    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.issued += 1;
        FetchTicket(self.issued)
    }

    /// Apply a fetch result, unless a later fetch already applied.
    ///
    /// Returns `None` when the result was discarded as stale.
    pub fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        incoming: impl IntoIterator<Item = GenerationRequest>,
    ) -> Option<Reconciliation> {
        if self.last_applied.is_some_and(|last| ticket <= last) {
            tracing::debug!(ticket = ticket.0, "Discarding out-of-order fetch result");
            return None;
        }
        self.last_applied = Some(ticket);
        Some(self.set_requests(incoming))
    }

    /// Fold a server-pushed event into the working set.
    ///
    /// An event is newer than any fetch already in flight, so applying one
    /// retires every ticket issued so far. A fetch begun afterwards still
    /// applies.
    pub fn apply_event(&mut self, event: &GenerationEvent) -> Reconciliation {
        self.last_applied = Some(FetchTicket(self.issued));
        if let Some(request) = &event.request {
            return self.set_requests([request.clone()]);
        }
        match event.kind {
            GenerationEventKind::RequestDeleted => match event.request_id {
                Some(id) => self.remove_request(id),
                None => Reconciliation::default(),
            },
            GenerationEventKind::ImagesDeleted => self.drop_images(&event.image_ids),
            _ => Reconciliation::default(),
        }
    }

    fn drop_images(&mut self, image_ids: &[DbId]) -> Reconciliation {
        let updated: Vec<GenerationRequest> = self
            .requests
            .values()
            .filter(|r| r.images.iter().any(|i| image_ids.contains(&i.id)))
            .map(|r| {
                let mut request = GenerationRequest::clone(r);
                request.images.retain(|i| !image_ids.contains(&i.id));
                request
            })
            .collect();
        self.set_requests(updated)
    }
}
