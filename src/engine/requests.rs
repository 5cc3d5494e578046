use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyEvent};

use super::{Engine, EngineError};

impl BookingRequest {
    pub fn pending(&self) -> Option<&Proposal> {
        self.history.iter().rev().find(|p| p.outcome == Outcome::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.history
            .iter()
            .filter(|p| p.outcome == Outcome::Pending)
            .count()
    }

    /// At most one pending proposal, and terminal requests have none.
    pub fn is_consistent(&self) -> bool {
        let pending = self.pending_count();
        pending <= 1 && !(self.status.is_terminal() && pending > 0)
    }

    /// Append a proposal, superseding the one it answers in the same step.
    pub(super) fn push_proposal(&mut self, proposal: Proposal) {
        for p in self.history.iter_mut().filter(|p| p.outcome == Outcome::Pending) {
            p.outcome = Outcome::Superseded;
        }
        self.history.push(proposal);
        debug_assert_eq!(self.pending_count(), 1);
    }

    /// Start negotiating over a slot just held for this request: the client's
    /// first proposal targets it and the provider is told to answer.
    pub(super) fn open_on_slot(
        &mut self,
        slot_id: Ulid,
        span: Span,
        now: Ms,
        expires_at: Ms,
    ) -> Notification {
        self.status = RequestStatus::AwaitingProviderResponse;
        self.slot_id = Some(slot_id);
        self.expires_at = Some(expires_at);
        self.waitlisted_at = None;
        self.push_proposal(Proposal {
            id: Ulid::new(),
            author: Party::Client,
            target: ProposalTarget::ExactSlot { slot_id, span },
            modality: self.modality,
            created_at: now,
            outcome: Outcome::Pending,
        });
        Notification::to_party(Party::Provider, &self.client, NotifyEvent::NewRequest, self.id)
    }

    /// Close out the pending proposal, if any.
    pub(super) fn settle_pending(&mut self, outcome: Outcome) {
        debug_assert_ne!(outcome, Outcome::Pending);
        if let Some(p) = self
            .history
            .iter_mut()
            .rev()
            .find(|p| p.outcome == Outcome::Pending)
        {
            p.outcome = outcome;
        }
    }

    /// Refuse an action by `actor` unless it is their turn on a live request.
    pub(super) fn ensure_turn(&self, actor: Party) -> Result<(), EngineError> {
        if self.status == RequestStatus::Expired {
            return Err(EngineError::Expired(self.id));
        }
        if self.status.turn() != Some(actor) {
            return Err(self.stale());
        }
        Ok(())
    }

    pub(super) fn ensure_live(&self) -> Result<(), EngineError> {
        match self.status {
            RequestStatus::Expired => Err(EngineError::Expired(self.id)),
            s if s.is_terminal() => Err(self.stale()),
            _ => Ok(()),
        }
    }

    pub(super) fn stale(&self) -> EngineError {
        EngineError::StaleState {
            id: self.id,
            current: self.status,
        }
    }
}

impl Engine {
    pub async fn get_request(&self, id: Ulid) -> Result<BookingRequest, EngineError> {
        let shared = self.get_shared(&id)?;
        let guard = shared.lock().await;
        Ok(guard.clone())
    }

    /// The request's proposals in the order they were made.
    pub async fn get_negotiation_history(&self, id: Ulid) -> Result<Vec<Proposal>, EngineError> {
        let shared = self.get_shared(&id)?;
        let guard = shared.lock().await;
        Ok(guard.history.clone())
    }

    /// Non-terminal requests, oldest first: the provider's inbox.
    pub async fn list_active(&self) -> Vec<BookingRequest> {
        self.collect_requests(|r| !r.status.is_terminal()).await
    }

    pub async fn list_for_client(&self, client: &str) -> Vec<BookingRequest> {
        self.collect_requests(|r| r.client == client).await
    }

    async fn collect_requests(&self, keep: impl Fn(&BookingRequest) -> bool) -> Vec<BookingRequest> {
        let shared: Vec<_> = self.requests.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for req in shared {
            let guard = req.lock().await;
            if keep(&guard) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    /// Non-terminal requests whose negotiation deadline has passed.
    /// Requests locked right now are skipped; the next sweep picks them up.
    pub fn collect_expired(&self, now: Ms) -> Vec<Ulid> {
        self.requests
            .iter()
            .filter_map(|entry| {
                let req = entry.value().try_lock().ok()?;
                let due = !req.status.is_terminal() && req.expires_at.is_some_and(|t| t <= now);
                due.then_some(req.id)
            })
            .collect()
    }
}
