//! Data models representing database entities and webhook payloads.

/// Card and card-user entities
pub mod card;
/// Card transactions, journal entries and deposit addresses
pub mod ledger;
/// Inbound event envelope and bodies
pub mod webhook;
