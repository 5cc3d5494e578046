//! Booking negotiation engine: one provider, many clients, and a
//! proposal/counter-proposal exchange over a shared set of slots.

pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweep;
pub mod time;

pub use engine::{Engine, EngineError};
