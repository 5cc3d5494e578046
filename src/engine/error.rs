use thiserror::Error;
use ulid::Ulid;

use crate::model::RequestStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("slot {0} is not available")]
    NotAvailable(Ulid),
    #[error("slot {slot_id} is not held by request {request_id}")]
    HoldMismatch { slot_id: Ulid, request_id: Ulid },
    #[error("request {id} is {} and cannot take this action", current.code())]
    StaleState { id: Ulid, current: RequestStatus },
    #[error("no open slot inside the proposed window")]
    NoOpenSlot,
    #[error("slot overlaps existing slot {0}")]
    Overlap(Ulid),
    #[error("request {0} has expired")]
    Expired(Ulid),
    #[error("provider is not accepting new requests")]
    ProviderUnavailable,
    #[error("request {0} reached the negotiation round limit")]
    RoundLimit(Ulid),
    #[error("invalid window: {0}")]
    InvalidWindow(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    Journal(String),
}

impl EngineError {
    /// Stable code for front-ends; never changes once published.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::NotAvailable(_) => "not_available",
            EngineError::HoldMismatch { .. } => "hold_mismatch",
            EngineError::StaleState { .. } => "stale_state",
            EngineError::NoOpenSlot => "no_open_slot",
            EngineError::Overlap(_) => "overlap",
            EngineError::Expired(_) => "expired",
            EngineError::ProviderUnavailable => "provider_unavailable",
            EngineError::RoundLimit(_) => "round_limit",
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Journal(_) => "journal",
        }
    }
}
