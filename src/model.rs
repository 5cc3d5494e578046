use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub use crate::time::{Ms, Span};

/// Opaque client identity handed in by a front-end (chat user id, web session).
pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    Online,
    Onsite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Individual,
    Couple,
}

/// One side of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    Client,
    Provider,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::Client => Party::Provider,
            Party::Provider => Party::Client,
        }
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Open,
    /// Advisory claim by an active negotiation; lapses at `expires_at`.
    Held { request_id: Ulid, expires_at: Ms },
    Booked { request_id: Ulid },
}

impl SlotStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, SlotStatus::Open)
    }

    /// The request holding or owning this slot, if any.
    pub fn claimant(&self) -> Option<Ulid> {
        match self {
            SlotStatus::Open => None,
            SlotStatus::Held { request_id, .. } | SlotStatus::Booked { request_id } => {
                Some(*request_id)
            }
        }
    }
}

/// A provider-declared bookable interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub span: Span,
    pub modality: Modality,
    pub status: SlotStatus,
}

// ── Requests and proposals ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    New,
    AwaitingProviderResponse,
    AwaitingClientResponse,
    Accepted,
    Rejected,
    Waitlisted,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Accepted
                | RequestStatus::Rejected
                | RequestStatus::Cancelled
                | RequestStatus::Expired
        )
    }

    /// The status in which `party` is expected to answer.
    pub fn awaiting(party: Party) -> RequestStatus {
        match party {
            Party::Client => RequestStatus::AwaitingClientResponse,
            Party::Provider => RequestStatus::AwaitingProviderResponse,
        }
    }

    /// Whose move it is, if anyone's.
    pub fn turn(&self) -> Option<Party> {
        match self {
            RequestStatus::AwaitingClientResponse => Some(Party::Client),
            RequestStatus::AwaitingProviderResponse => Some(Party::Provider),
            _ => None,
        }
    }

    /// Stable code for front-ends.
    pub fn code(&self) -> &'static str {
        match self {
            RequestStatus::New => "new",
            RequestStatus::AwaitingProviderResponse => "awaiting_provider",
            RequestStatus::AwaitingClientResponse => "awaiting_client",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Waitlisted => "waitlisted",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }
}

/// What a proposal offers: a concrete slot, or a window still to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalTarget {
    ExactSlot { slot_id: Ulid, span: Span },
    PreferredWindow { window: Span },
}

impl ProposalTarget {
    pub fn span(&self) -> Span {
        match self {
            ProposalTarget::ExactSlot { span, .. } => *span,
            ProposalTarget::PreferredWindow { window } => *window,
        }
    }

    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            ProposalTarget::ExactSlot { slot_id, .. } => Some(*slot_id),
            ProposalTarget::PreferredWindow { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Pending,
    Superseded,
    Accepted,
    Rejected,
    /// The negotiation ended without an answer (cancellation or expiry).
    Lapsed,
}

/// One negotiation turn. Only `outcome` ever changes, and only away from `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Ulid,
    pub author: Party,
    pub target: ProposalTarget,
    pub modality: Modality,
    pub created_at: Ms,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub client: ClientId,
    pub session_type: SessionType,
    pub modality: Modality,
    pub description: String,
    pub contact: Option<String>,
    pub desired: Span,
    pub status: RequestStatus,
    /// Slot currently held or booked for this request.
    pub slot_id: Option<Ulid>,
    /// Append-only negotiation history.
    pub history: Vec<Proposal>,
    /// Bumped on every committed transition.
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Negotiation deadline while awaiting an answer.
    pub expires_at: Option<Ms>,
    pub waitlisted_at: Option<Ms>,
}

// ── Inputs ───────────────────────────────────────────────────────

/// A client's first submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub client: ClientId,
    pub session_type: SessionType,
    pub modality: Modality,
    pub desired: Span,
    pub description: String,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferTarget {
    Slot(Ulid),
    Window(Span),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOffer {
    pub target: OfferTarget,
    /// Defaults to the modality of the proposal being countered.
    pub modality: Option<Modality>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Accept,
    Reject,
    Counter(CounterOffer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub request_id: Ulid,
    pub desired: Span,
    pub modality: Modality,
    pub enqueued_at: Ms,
}

// ── Journal records ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    pub slot_id: Ulid,
    pub status: SlotStatus,
}

/// One durable record. Each negotiation transition is a single `Committed`
/// record so request and slot changes replay together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotDeclared { slot: Slot },
    SlotRemoved { id: Ulid },
    Committed {
        request: BookingRequest,
        slot_changes: Vec<SlotChange>,
    },
    AcceptingChanged { accepting: bool },
}
