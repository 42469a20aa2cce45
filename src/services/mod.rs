//! Business logic services.
//!
//! Services contain the reconciliation core separated from HTTP handlers:
//! pure validation and balance math, the transactional engine, fees and
//! risk, outbound collaborators, and the event router tying them together.

pub mod balance;
pub mod fees;
pub mod idempotency;
pub mod lock;
pub mod notifications;
pub mod profiles;
pub mod provider;
pub mod reconciliation;
pub mod risk;
pub mod router;
