use std::collections::VecDeque;

use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::slots::SlotTxn;
use super::{Effects, Engine};

/// FIFO of requests waiting for a matching slot.
#[derive(Debug, Default)]
pub struct Waitlist {
    entries: VecDeque<WaitlistEntry>,
}

impl Waitlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, request_id: &Ulid) -> bool {
        self.entries.iter().any(|e| e.request_id == *request_id)
    }

    /// Append at the back. Already-queued requests keep their place.
    pub fn enqueue(&mut self, entry: WaitlistEntry) -> bool {
        if self.contains(&entry.request_id) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    pub fn remove(&mut self, request_id: &Ulid) -> Option<WaitlistEntry> {
        let pos = self.entries.iter().position(|e| e.request_id == *request_id)?;
        self.entries.remove(pos)
    }

    /// Entries the slot could serve, in queue order.
    pub fn candidates(&self, slot: &Slot) -> Vec<WaitlistEntry> {
        self.entries
            .iter()
            .filter(|e| e.modality == slot.modality && e.desired.overlaps(&slot.span))
            .cloned()
            .collect()
    }

    pub fn has_candidate(&self, slot: &Slot) -> bool {
        self.entries
            .iter()
            .any(|e| e.modality == slot.modality && e.desired.overlaps(&slot.span))
    }

    pub fn entries(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.entries.iter()
    }
}

impl Engine {
    pub async fn waitlist_snapshot(&self) -> Vec<WaitlistEntry> {
        self.waitlist.lock().await.entries().cloned().collect()
    }

    /// A slot just became open: hand it to the earliest waitlisted request
    /// that fits. At most one request is matched per call.
    pub(super) async fn match_waitlist(&self, slot_id: Ulid) -> Effects {
        let Some(slot) = self.slots.read().await.get(&slot_id).cloned() else {
            return Effects::default();
        };
        if !slot.status.is_open() {
            return Effects::default();
        }
        let candidates = self.waitlist.lock().await.candidates(&slot);

        for entry in candidates {
            let Ok(shared) = self.get_shared(&entry.request_id) else {
                self.waitlist.lock().await.remove(&entry.request_id);
                continue;
            };
            let mut guard = shared.lock().await;
            if guard.status != RequestStatus::Waitlisted {
                self.waitlist.lock().await.remove(&entry.request_id);
                continue;
            }

            let mut slots = self.slots.write().await;
            let now = self.clock.now();
            let expires_at = now + self.config.negotiation_timeout_ms;
            let mut txn = SlotTxn::new(&slots);
            let span = match txn.hold(slot_id, guard.id, expires_at) {
                Ok(span) => span,
                Err(e) => {
                    // Someone else claimed the slot first; the queue stays as it is.
                    debug!("waitlist match on slot {slot_id} lost: {e}");
                    return Effects::default();
                }
            };
            let changes = txn.into_changes();

            let mut next = guard.clone();
            let notification = next.open_on_slot(slot_id, span, now, expires_at);

            if let Err(e) = self.commit(&mut guard, next, &mut slots, changes).await {
                tracing::warn!("waitlist match for {} not committed: {e}", entry.request_id);
                return Effects::default();
            }
            self.waitlist.lock().await.remove(&entry.request_id);
            drop(slots);

            info!("waitlisted request {} matched to slot {slot_id}", guard.id);
            metrics::counter!(crate::observability::WAITLIST_MATCHES_TOTAL).increment(1);
            metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "transition" => "waitlist_match")
                .increment(1);
            return Effects {
                notifications: vec![notification],
                opened: Vec::new(),
            };
        }
        Effects::default()
    }
}
