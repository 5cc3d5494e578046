use tracing::info;
use ulid::Ulid;

use crate::config::OverlapScope;
use crate::limits::*;
use crate::model::*;

use super::{Effects, Engine, EngineError};

/// The provider's slots, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct SlotBook {
    slots: Vec<Slot>,
}

impl SlotBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == *id)
    }

    /// Insert maintaining sort order by span.start.
    pub(super) fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .partition_point(|s| s.span.start <= slot.span.start);
        self.slots.insert(pos, slot);
    }

    pub(super) fn remove(&mut self, id: &Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == *id)?;
        Some(self.slots.remove(pos))
    }

    pub(super) fn apply(&mut self, changes: &[SlotChange]) {
        for change in changes {
            if let Some(slot) = self.slots.iter_mut().find(|s| s.id == change.slot_id) {
                slot.status = change.status;
            }
        }
    }

    /// Slots whose span overlaps `query`. Everything from the first slot
    /// starting at or after `query.end` onwards is skipped.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> + use<'_> {
        let query = *query;
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Open slots of `modality` overlapping `window`, earliest first. Lazy;
    /// call again to restart.
    pub fn list_open(
        &self,
        modality: Modality,
        window: Span,
    ) -> impl Iterator<Item = &Slot> + use<'_> {
        self.overlapping(&window)
            .filter(move |s| s.modality == modality && s.status.is_open())
    }

    /// Reject `span` if it collides with an existing slot in the same pool.
    pub fn check_overlap(
        &self,
        span: &Span,
        modality: Modality,
        scope: OverlapScope,
    ) -> Result<(), EngineError> {
        match self
            .overlapping(span)
            .find(|s| scope == OverlapScope::Global || s.modality == modality)
        {
            Some(existing) => Err(EngineError::Overlap(existing.id)),
            None => Ok(()),
        }
    }
}

/// Staged slot mutations for one transition, validated against the book as
/// it would look with the staged changes applied. Nothing touches the book
/// until the engine commits `changes`.
pub(super) struct SlotTxn<'a> {
    book: &'a SlotBook,
    changes: Vec<SlotChange>,
}

impl<'a> SlotTxn<'a> {
    pub fn new(book: &'a SlotBook) -> Self {
        Self {
            book,
            changes: Vec::new(),
        }
    }

    pub fn book_ref(&self) -> &'a SlotBook {
        self.book
    }

    pub fn slot(&self, id: Ulid) -> Result<&'a Slot, EngineError> {
        self.book.get(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn status(&self, id: Ulid) -> Result<SlotStatus, EngineError> {
        let slot = self.slot(id)?;
        Ok(self.effective(slot))
    }

    fn effective(&self, slot: &Slot) -> SlotStatus {
        self.changes
            .iter()
            .rev()
            .find(|c| c.slot_id == slot.id)
            .map_or(slot.status, |c| c.status)
    }

    fn stage(&mut self, slot_id: Ulid, status: SlotStatus) {
        self.changes.push(SlotChange { slot_id, status });
    }

    /// `Open → Held`. Re-holding a slot this request already holds only
    /// moves the deadline.
    pub fn hold(&mut self, slot_id: Ulid, request_id: Ulid, expires_at: Ms) -> Result<Span, EngineError> {
        let slot = self.slot(slot_id)?;
        match self.effective(slot) {
            SlotStatus::Open => {}
            SlotStatus::Held { request_id: holder, .. } if holder == request_id => {}
            _ => return Err(EngineError::NotAvailable(slot_id)),
        }
        // Overlapping slots from another pool must not be claimed either.
        let clash = self.book.overlapping(&slot.span).any(|other| {
            other.id != slot_id
                && self
                    .effective(other)
                    .claimant()
                    .is_some_and(|holder| holder != request_id)
        });
        if clash {
            return Err(EngineError::NotAvailable(slot_id));
        }
        self.stage(slot_id, SlotStatus::Held { request_id, expires_at });
        Ok(slot.span)
    }

    /// `Held → Open`. Idempotent on open slots; booked slots are left alone.
    /// Returns true if the slot ends up open because of this call.
    pub fn release(&mut self, slot_id: Ulid) -> Result<bool, EngineError> {
        match self.status(slot_id)? {
            SlotStatus::Held { .. } => {
                self.stage(slot_id, SlotStatus::Open);
                Ok(true)
            }
            SlotStatus::Open | SlotStatus::Booked { .. } => Ok(false),
        }
    }

    /// `Held → Booked`, only for the holder.
    pub fn book(&mut self, slot_id: Ulid, request_id: Ulid) -> Result<(), EngineError> {
        match self.status(slot_id)? {
            SlotStatus::Held { request_id: holder, .. } if holder == request_id => {
                self.stage(slot_id, SlotStatus::Booked { request_id });
                Ok(())
            }
            _ => Err(EngineError::HoldMismatch { slot_id, request_id }),
        }
    }

    /// Slots this transaction leaves open that were claimed before it.
    pub fn opened(&self) -> Vec<Ulid> {
        let mut opened: Vec<Ulid> = Vec::new();
        for change in &self.changes {
            if opened.contains(&change.slot_id) {
                continue;
            }
            let Ok(slot) = self.slot(change.slot_id) else { continue };
            if !slot.status.is_open() && self.effective(slot).is_open() {
                opened.push(change.slot_id);
            }
        }
        opened
    }

    pub fn into_changes(self) -> Vec<SlotChange> {
        self.changes
    }
}

pub(super) fn validate_slot_span(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidWindow("slot must end after it starts"));
    }
    if span.start <= now {
        return Err(EngineError::InvalidWindow("slot must start in the future"));
    }
    if span.duration_ms() < MIN_SLOT_DURATION_MS {
        return Err(EngineError::InvalidWindow("slot shorter than 15 minutes"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::InvalidWindow("slot longer than 4 hours"));
    }
    Ok(())
}

impl Engine {
    /// Provider opens a new bookable slot. Waitlisted requests get first call on it.
    pub async fn declare_slot(&self, span: Span, modality: Modality) -> Result<Slot, EngineError> {
        validate_slot_span(&span, self.clock.now())?;
        let slot = {
            let mut slots = self.slots.write().await;
            if slots.len() >= MAX_SLOTS {
                return Err(EngineError::LimitExceeded("too many slots"));
            }
            slots.check_overlap(&span, modality, self.config.overlap_scope)?;

            let slot = Slot {
                id: Ulid::new(),
                span,
                modality,
                status: SlotStatus::Open,
            };
            self.journal_append(&Event::SlotDeclared { slot: slot.clone() })
                .await?;
            slots.insert(slot.clone());
            slot
        };
        info!("slot {} declared [{}, {}) {:?}", slot.id, span.start, span.end, modality);
        metrics::counter!(crate::observability::SLOTS_DECLARED_TOTAL).increment(1);

        self.dispatch(Effects {
            notifications: Vec::new(),
            opened: vec![slot.id],
        })
        .await;
        Ok(slot)
    }

    /// Remove an open slot. Held or booked slots must be freed through their request first.
    pub async fn remove_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        let mut slots = self.slots.write().await;
        let slot = slots.get(&id).ok_or(EngineError::NotFound(id))?;
        if !slot.status.is_open() {
            return Err(EngineError::NotAvailable(id));
        }
        self.journal_append(&Event::SlotRemoved { id }).await?;
        let removed = slots.remove(&id).ok_or(EngineError::NotFound(id))?;
        info!("slot {id} removed");
        Ok(removed)
    }

    pub async fn list_open(&self, modality: Modality, window: Span) -> Vec<Slot> {
        let slots = self.slots.read().await;
        slots.list_open(modality, window).cloned().collect()
    }

    /// Every slot with its status, for the provider's calendar view.
    pub async fn list_slots(&self) -> Vec<Slot> {
        self.slots.read().await.iter().cloned().collect()
    }

    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, EngineError> {
        self.slots
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }
}
