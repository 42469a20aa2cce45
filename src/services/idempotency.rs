//! Idempotency and state-transition validation for ledger lines.
//!
//! Pure functions: given the line already stored for a provider reference
//! (if any) and the incoming event, decide whether the event is new, a
//! duplicate delivery, or an inconsistent transition.
//!
//! # Rules (evaluated in order)
//!
//! 1. No existing line: valid, create it.
//! 2. Same status and amount within tolerance: duplicate, skip.
//! 3. Existing line terminal, status differs: `invalid_status_transition`.
//! 4. Amount differs beyond tolerance: `amount_mismatch`.
//! 5. Decline carrying an amount where nothing was held: `invalid_amount_for_declined`.

use crate::{
    error::Rejection,
    models::ledger::{CardTransaction, CardTransactionStatus},
};

/// Basis-point denominator.
const BPS: i128 = 10_000;

/// Status and amount of the stored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub status: CardTransactionStatus,
    pub amount: i64,
}

impl From<&CardTransaction> for LedgerSnapshot {
    fn from(line: &CardTransaction) -> Self {
        Self {
            status: line.status,
            amount: line.amount,
        }
    }
}

/// Status and amount carried by the incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingEvent {
    pub status: CardTransactionStatus,
    pub amount: i64,
}

/// Validator verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub is_valid: bool,
    pub should_skip: bool,
    pub reason: Option<ValidationReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    AlreadyProcessed,
    Rejected(Rejection),
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::AlreadyProcessed => "transaction_already_processed",
            ValidationReason::Rejected(rejection) => rejection.as_str(),
        }
    }
}

impl Validation {
    fn proceed() -> Self {
        Self {
            is_valid: true,
            should_skip: false,
            reason: None,
        }
    }

    fn duplicate() -> Self {
        Self {
            is_valid: true,
            should_skip: true,
            reason: Some(ValidationReason::AlreadyProcessed),
        }
    }

    fn reject(rejection: Rejection) -> Self {
        Self {
            is_valid: false,
            should_skip: false,
            reason: Some(ValidationReason::Rejected(rejection)),
        }
    }

    /// Whether the caller may go on to mutate balances.
    pub fn may_proceed(&self) -> bool {
        self.is_valid && !self.should_skip
    }
}

/// Amount tolerance, in basis points of the stored amount.
///
/// Changes above half the tolerance are logged as warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountTolerance {
    bps: u32,
}

impl AmountTolerance {
    pub fn from_bps(bps: u32) -> Self {
        Self { bps }
    }

    pub fn bps(&self) -> u32 {
        self.bps
    }

    /// Relative difference in basis points, `None` when the stored amount is zero.
    fn relative_change_bps(existing: i64, incoming: i64) -> Option<i128> {
        if existing == 0 {
            return None;
        }
        let diff = (i128::from(incoming) - i128::from(existing)).abs();
        // Rounded up so any change beyond the tolerance is reported as such.
        let base = i128::from(existing).abs();
        Some((diff * BPS + base - 1) / base)
    }

    fn within(&self, existing: i64, incoming: i64) -> bool {
        match Self::relative_change_bps(existing, incoming) {
            Some(change) => change <= i128::from(self.bps),
            None => incoming == 0,
        }
    }
}

impl Default for AmountTolerance {
    fn default() -> Self {
        Self::from_bps(500)
    }
}

/// Decide what to do with an incoming event.
pub fn validate_transition(
    existing: Option<LedgerSnapshot>,
    incoming: IncomingEvent,
    tolerance: AmountTolerance,
) -> Validation {
    // Rule 1
    let Some(existing) = existing else {
        return Validation::proceed();
    };

    let amount_within = tolerance.within(existing.amount, incoming.amount);

    // Rule 2
    if existing.status == incoming.status && amount_within {
        return Validation::duplicate();
    }

    // Rule 3
    if existing.status.is_terminal() && existing.status != incoming.status {
        tracing::warn!(
            from = %existing.status,
            to = %incoming.status,
            "Rejected transition out of terminal status"
        );
        return Validation::reject(Rejection::InvalidStatusTransition);
    }

    // Rule 5 is checked ahead of rule 4 when nothing was held: a zero-amount
    // line has no relative tolerance to compare against.
    if existing.amount == 0
        && incoming.status == CardTransactionStatus::Declined
        && incoming.amount != 0
    {
        return Validation::reject(Rejection::InvalidAmountForDeclined);
    }

    // Rule 4
    if !amount_within {
        tracing::warn!(
            existing_amount = existing.amount,
            incoming_amount = incoming.amount,
            tolerance_bps = tolerance.bps(),
            "Rejected amount change beyond tolerance"
        );
        return Validation::reject(Rejection::AmountMismatch);
    }

    if let Some(change) = AmountTolerance::relative_change_bps(existing.amount, incoming.amount)
        && change * 2 > i128::from(tolerance.bps())
    {
        tracing::warn!(
            existing_amount = existing.amount,
            incoming_amount = incoming.amount,
            change_bps = change as i64,
            "Large amount change within tolerance"
        );
    }

    Validation::proceed()
}
