//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! They can:
//! - Authenticate requests
//! - Short-circuit requests (reject unsigned webhooks)

/// Provider webhook signature verification
pub mod signature;
