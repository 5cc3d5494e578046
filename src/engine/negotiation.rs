//! The negotiation state machine.
//!
//! Every transition follows the same shape: lock the request, lock the slot
//! book, stage slot changes in a [`SlotTxn`] against a clone of the request,
//! commit both in one journal record, then notify and feed reopened slots to
//! the waitlist after all locks are dropped.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotifyEvent};

use super::slots::SlotTxn;
use super::{Effects, Engine, EngineError};

fn validate_submission(sub: &Submission, now: Ms) -> Result<(), EngineError> {
    if sub.desired.start >= sub.desired.end {
        return Err(EngineError::InvalidWindow("window must end after it starts"));
    }
    if sub.desired.end <= now {
        return Err(EngineError::InvalidWindow("window is in the past"));
    }
    if sub.desired.duration_ms() > MAX_WINDOW_MS {
        return Err(EngineError::InvalidWindow("window too wide"));
    }
    if sub.client.is_empty() || sub.client.len() > MAX_CLIENT_ID_LEN {
        return Err(EngineError::LimitExceeded("client id length"));
    }
    if sub.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if sub.contact.as_ref().is_some_and(|c| c.len() > MAX_CONTACT_LEN) {
        return Err(EngineError::LimitExceeded("contact too long"));
    }
    Ok(())
}

fn record(transition: &'static str) {
    metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "transition" => transition)
        .increment(1);
}

fn record_error<T>(result: Result<T, EngineError>) -> Result<T, EngineError> {
    if let Err(e) = &result {
        metrics::counter!(crate::observability::ERRORS_TOTAL, "code" => e.code()).increment(1);
    }
    result
}

impl Engine {
    /// Client submits a new request. Holds the earliest open matching slot,
    /// or parks the request on the waitlist.
    pub async fn submit_request(&self, sub: Submission) -> Result<Ulid, EngineError> {
        record_error(self.submit_inner(sub).await)
    }

    async fn submit_inner(&self, sub: Submission) -> Result<Ulid, EngineError> {
        if !self.is_accepting_requests() {
            return Err(EngineError::ProviderUnavailable);
        }
        let now = self.clock.now();
        validate_submission(&sub, now)?;
        if self.requests.len() >= MAX_REQUESTS {
            return Err(EngineError::LimitExceeded("too many requests"));
        }

        let id = Ulid::new();
        let fresh = BookingRequest {
            id,
            client: sub.client,
            session_type: sub.session_type,
            modality: sub.modality,
            description: sub.description,
            contact: sub.contact,
            desired: sub.desired,
            status: RequestStatus::New,
            slot_id: None,
            history: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
            waitlisted_at: None,
        };
        let shared = Arc::new(Mutex::new(fresh));
        let mut guard = shared.clone().lock_owned().await;

        let mut slots = self.slots.write().await;
        let expires_at = now + self.config.negotiation_timeout_ms;
        let mut txn = SlotTxn::new(&slots);
        // A slot some waitlisted request could take is theirs; dispatch hands it over.
        let waitlist = self.waitlist.lock().await;
        let candidates: Vec<Ulid> = slots
            .list_open(guard.modality, guard.desired)
            .filter(|s| !waitlist.has_candidate(s))
            .map(|s| s.id)
            .collect();
        drop(waitlist);
        let held = candidates
            .into_iter()
            .find_map(|slot_id| txn.hold(slot_id, id, expires_at).ok().map(|span| (slot_id, span)));
        let changes = txn.into_changes();

        let mut next = guard.clone();
        let effects = match held {
            Some((slot_id, span)) => Effects {
                notifications: vec![next.open_on_slot(slot_id, span, now, expires_at)],
                opened: Vec::new(),
            },
            None => {
                next.status = RequestStatus::Waitlisted;
                next.waitlisted_at = Some(now);
                Effects {
                    notifications: vec![Notification::to_party(
                        Party::Client,
                        &next.client,
                        NotifyEvent::Waitlisted,
                        id,
                    )],
                    opened: Vec::new(),
                }
            }
        };

        // Visible to other actors only once inserted; they then queue on our lock.
        self.requests.insert(id, shared);
        if let Err(e) = self.commit(&mut guard, next, &mut slots, changes).await {
            self.requests.remove(&id);
            return Err(e);
        }
        // Enqueue before the slot book unlocks so a concurrent release can't slip past us.
        if guard.status == RequestStatus::Waitlisted {
            self.waitlist.lock().await.enqueue(WaitlistEntry {
                request_id: id,
                desired: guard.desired,
                modality: guard.modality,
                enqueued_at: now,
            });
        }
        drop(slots);

        info!("request {id} submitted by {}: {}", guard.client, guard.status.code());
        record(if guard.status == RequestStatus::Waitlisted {
            "submit_waitlisted"
        } else {
            "submit_held"
        });
        drop(guard);
        self.dispatch(effects).await;
        Ok(id)
    }

    /// Answer the pending proposal. Only the party whose turn it is may act.
    /// `expected_version`, when given, must match the request's current version.
    pub async fn respond_to_request(
        &self,
        id: Ulid,
        actor: Party,
        decision: Decision,
        expected_version: Option<u64>,
    ) -> Result<BookingRequest, EngineError> {
        record_error(self.respond_inner(id, actor, decision, expected_version).await)
    }

    async fn respond_inner(
        &self,
        id: Ulid,
        actor: Party,
        decision: Decision,
        expected_version: Option<u64>,
    ) -> Result<BookingRequest, EngineError> {
        let shared = self.get_shared(&id)?;
        let mut guard = shared.lock().await;
        guard.ensure_turn(actor)?;
        if expected_version.is_some_and(|v| v != guard.version) {
            return Err(guard.stale());
        }

        let mut slots = self.slots.write().await;
        let now = self.clock.now();
        let mut txn = SlotTxn::new(&slots);
        let mut next = guard.clone();
        let (event, label) = match decision {
            Decision::Accept => (self.accept(&mut next, &mut txn)?, "accept"),
            Decision::Reject => (reject(&mut next, &mut txn)?, "reject"),
            Decision::Counter(offer) => (self.counter(&mut next, &mut txn, actor, offer, now)?, "counter"),
        };
        let opened = txn.opened();
        let changes = txn.into_changes();
        self.commit(&mut guard, next, &mut slots, changes).await?;
        drop(slots);

        info!("request {id}: {actor:?} {label} -> {}", guard.status.code());
        record(label);
        let effects = Effects {
            notifications: vec![Notification::to_party(actor.other(), &guard.client, event, id)],
            opened,
        };
        let snapshot = guard.clone();
        drop(guard);
        self.dispatch(effects).await;
        Ok(snapshot)
    }

    /// Book the pending proposal's slot. A preferred window is resolved to
    /// its earliest open slot first.
    fn accept(&self, next: &mut BookingRequest, txn: &mut SlotTxn<'_>) -> Result<NotifyEvent, EngineError> {
        let pending = next.pending().cloned().ok_or_else(|| next.stale())?;
        let slot_id = match pending.target {
            ProposalTarget::ExactSlot { slot_id, .. } => slot_id,
            ProposalTarget::PreferredWindow { window } => {
                let deadline = next.expires_at.unwrap_or(pending.created_at);
                self.resolve_window(next, txn, window, pending.modality, deadline)?
            }
        };
        txn.book(slot_id, next.id)?;
        next.settle_pending(Outcome::Accepted);
        next.status = RequestStatus::Accepted;
        next.slot_id = Some(slot_id);
        next.expires_at = None;
        Ok(NotifyEvent::Accepted)
    }

    /// Earliest open slot of `modality` fully inside `window`, held for `next`.
    fn resolve_window(
        &self,
        next: &BookingRequest,
        txn: &mut SlotTxn<'_>,
        window: Span,
        modality: Modality,
        expires_at: Ms,
    ) -> Result<Ulid, EngineError> {
        self.slots_in(txn, modality, window)
            .into_iter()
            .find(|slot_id| txn.hold(*slot_id, next.id, expires_at).is_ok())
            .ok_or(EngineError::NoOpenSlot)
    }

    fn slots_in(&self, txn: &SlotTxn<'_>, modality: Modality, window: Span) -> Vec<Ulid> {
        txn.book_ref()
            .overlapping(&window)
            .filter(|s| s.modality == modality && window.contains_span(&s.span))
            .filter(|s| txn.status(s.id).is_ok_and(|st| st.is_open()))
            .map(|s| s.id)
            .collect()
    }

    /// Counter-proposal by either party. Client and provider run exactly
    /// this code; only `actor` differs.
    fn counter(
        &self,
        next: &mut BookingRequest,
        txn: &mut SlotTxn<'_>,
        actor: Party,
        offer: CounterOffer,
        now: Ms,
    ) -> Result<NotifyEvent, EngineError> {
        if next.history.len() >= self.config.max_rounds {
            return Err(EngineError::RoundLimit(next.id));
        }
        let current_modality = next.pending().map_or(next.modality, |p| p.modality);
        let expires_at = now + self.config.negotiation_timeout_ms;

        let (target, modality) = match offer.target {
            OfferTarget::Slot(slot_id) => {
                let slot = txn.slot(slot_id)?;
                (
                    ProposalTarget::ExactSlot {
                        slot_id,
                        span: slot.span,
                    },
                    slot.modality,
                )
            }
            OfferTarget::Window(window) => {
                if window.start >= window.end {
                    return Err(EngineError::InvalidWindow("window must end after it starts"));
                }
                if window.end <= now {
                    return Err(EngineError::InvalidWindow("window is in the past"));
                }
                let modality = offer.modality.unwrap_or(current_modality);
                let exact = txn
                    .book_ref()
                    .overlapping(&window)
                    .find(|s| {
                        s.span == window
                            && s.modality == modality
                            && txn.status(s.id).is_ok_and(|st| st.is_open() || st.claimant() == Some(next.id))
                    })
                    .map(|s| s.id);
                let target = match exact {
                    Some(slot_id) => ProposalTarget::ExactSlot { slot_id, span: window },
                    None => ProposalTarget::PreferredWindow { window },
                };
                (target, modality)
            }
        };

        // Release before hold so a neighbouring slot isn't blocked by our own old claim.
        let new_slot = target.slot_id();
        if let Some(old) = next.slot_id.filter(|old| Some(*old) != new_slot) {
            txn.release(old)?;
        }
        if let Some(slot_id) = new_slot {
            txn.hold(slot_id, next.id, expires_at)?;
        }

        next.push_proposal(Proposal {
            id: Ulid::new(),
            author: actor,
            target,
            modality,
            created_at: now,
            outcome: Outcome::Pending,
        });
        next.status = RequestStatus::awaiting(actor.other());
        next.slot_id = new_slot;
        next.expires_at = Some(expires_at);
        Ok(NotifyEvent::CounterProposed)
    }

    /// Either party withdraws. Works from any non-terminal state, including the waitlist.
    pub async fn cancel_request(&self, id: Ulid, actor: Party) -> Result<(), EngineError> {
        let (req, opened) =
            record_error(self.close(id, RequestStatus::Cancelled, |req| req.ensure_live()).await)?;
        info!("request {id} cancelled by {actor:?}");
        record("cancel");
        self.dispatch(Effects {
            notifications: vec![Notification::to_party(
                actor.other(),
                &req.client,
                NotifyEvent::Cancelled,
                id,
            )],
            opened,
        })
        .await;
        Ok(())
    }

    /// Expire a request whose deadline has passed. Same locking as every
    /// other transition, so an expiry and an accept can't both win.
    /// Returns false if the request is not (or no longer) due.
    pub async fn expire_request(&self, id: Ulid) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let closed = self
            .close(id, RequestStatus::Expired, |req| {
                req.ensure_live()?;
                if req.expires_at.is_some_and(|t| t <= now) {
                    Ok(())
                } else {
                    Err(req.stale())
                }
            })
            .await;
        let (req, opened) = match closed {
            Ok(closed) => closed,
            Err(EngineError::StaleState { .. } | EngineError::Expired(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        info!("request {id} expired");
        record("expire");
        metrics::counter!(crate::observability::SWEEP_EXPIRED_TOTAL).increment(1);
        let notifications = [Party::Client, Party::Provider]
            .into_iter()
            .map(|party| Notification::to_party(party, &req.client, NotifyEvent::Expired, id))
            .collect();
        self.dispatch(Effects {
            notifications,
            opened,
        })
        .await;
        Ok(true)
    }

    /// Shared path into `Cancelled`/`Expired`: release the slot, mark the
    /// pending proposal lapsed, leave the waitlist. Returns the closed
    /// request and any slot it freed.
    async fn close(
        &self,
        id: Ulid,
        status: RequestStatus,
        precondition: impl FnOnce(&BookingRequest) -> Result<(), EngineError>,
    ) -> Result<(BookingRequest, Vec<Ulid>), EngineError> {
        let shared = self.get_shared(&id)?;
        let mut guard = shared.lock().await;
        precondition(&guard)?;
        let was_waitlisted = guard.status == RequestStatus::Waitlisted;

        let mut slots = self.slots.write().await;
        let mut txn = SlotTxn::new(&slots);
        if let Some(slot_id) = guard.slot_id {
            txn.release(slot_id)?;
        }
        let opened = txn.opened();
        let changes = txn.into_changes();

        let mut next = guard.clone();
        next.settle_pending(Outcome::Lapsed);
        next.status = status;
        next.slot_id = None;
        next.expires_at = None;
        next.waitlisted_at = None;
        self.commit(&mut guard, next, &mut slots, changes).await?;
        if was_waitlisted {
            self.waitlist.lock().await.remove(&id);
        }
        Ok((guard.clone(), opened))
    }
}

/// Decline the pending proposal and free its slot.
fn reject(next: &mut BookingRequest, txn: &mut SlotTxn<'_>) -> Result<NotifyEvent, EngineError> {
    if let Some(slot_id) = next.slot_id {
        txn.release(slot_id)?;
    }
    next.settle_pending(Outcome::Rejected);
    next.status = RequestStatus::Rejected;
    next.slot_id = None;
    next.expires_at = None;
    Ok(NotifyEvent::Rejected)
}
