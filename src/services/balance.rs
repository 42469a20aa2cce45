//! Pure balance computations.
//!
//! Nothing here touches the store: amounts are validated, deltas computed
//! and new balances bounded before the reconciliation engine writes them.

use uuid::Uuid;

use crate::{
    error::{EngineError, Rejection},
    models::{
        card::{Card, CardStatus, CardUser},
        ledger::CardTransactionStatus,
    },
    services::idempotency::{IncomingEvent, LedgerSnapshot},
};

/// Largest amount or balance the ledger accepts (2^53 - 1).
///
/// Matches the integer range JSON consumers can represent exactly.
pub const MAX_SAFE_AMOUNT: i64 = 9_007_199_254_740_991;

/// Convert a wire amount into integer minor units.
///
/// Rejects non-finite, negative and fractional values, and anything above
/// `MAX_SAFE_AMOUNT`.
pub fn to_minor_units(raw: f64) -> Result<i64, EngineError> {
    if !raw.is_finite() {
        return Err(EngineError::InvalidAmount(format!("{raw} is not finite")));
    }
    if raw < 0.0 {
        return Err(EngineError::InvalidAmount(format!("{raw} is negative")));
    }
    if raw.fract() != 0.0 {
        return Err(EngineError::InvalidAmount(format!(
            "{raw} has fractional minor units"
        )));
    }
    if raw > MAX_SAFE_AMOUNT as f64 {
        return Err(EngineError::AmountExceedsSafeInteger(format!("{raw:.0}")));
    }
    Ok(raw as i64)
}

/// Bound an integer amount to `0..=MAX_SAFE_AMOUNT`.
pub fn ensure_safe_amount(amount: i64) -> Result<i64, EngineError> {
    if amount < 0 {
        return Err(EngineError::InvalidAmount(format!("{amount} is negative")));
    }
    if amount > MAX_SAFE_AMOUNT {
        return Err(EngineError::AmountExceedsSafeInteger(amount.to_string()));
    }
    Ok(amount)
}

/// Split of a funding event into fee and credited amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositCredit {
    pub amount: i64,
    pub fee: i64,
    pub amount_to_credit: i64,
}

/// `amount_to_credit = amount - fee`, which must stay positive.
pub fn deposit_credit(amount: i64, fee: i64) -> Result<DepositCredit, EngineError> {
    ensure_safe_amount(amount)?;
    if fee < 0 {
        return Err(EngineError::InvalidAmount(format!("fee {fee} is negative")));
    }

    let amount_to_credit = amount - fee;
    if amount_to_credit <= 0 {
        return Err(EngineError::NonPositiveCredit { amount, fee });
    }

    Ok(DepositCredit {
        amount,
        fee,
        amount_to_credit,
    })
}

/// Apply a signed delta to a balance, keeping it within `0..=MAX_SAFE_AMOUNT`.
pub fn apply_delta(
    entity: &'static str,
    id: Uuid,
    balance: i64,
    delta: i64,
) -> Result<i64, EngineError> {
    let new_balance = balance
        .checked_add(delta)
        .filter(|b| *b <= MAX_SAFE_AMOUNT)
        .ok_or_else(|| EngineError::AmountExceedsSafeInteger(format!("{balance} + {delta}")))?;

    if new_balance < 0 {
        return Err(EngineError::NegativeBalance { entity, id });
    }
    Ok(new_balance)
}

/// Signed balance change caused by a spend event.
///
/// - new pending or successful spend: debit the amount
/// - new declined or canceled spend: nothing was held, no change
/// - pending to successful: funds already held; only a tolerated amount
///   difference is settled
/// - pending to declined or canceled: release the held amount
pub fn spend_delta(existing: Option<LedgerSnapshot>, incoming: IncomingEvent) -> i64 {
    use CardTransactionStatus::*;

    match (existing, incoming.status) {
        (None, Pending | Successful) => -incoming.amount,
        (None, Declined | Canceled) => 0,
        (Some(held), Successful) if held.status == Pending => held.amount - incoming.amount,
        (Some(held), Declined | Canceled) if held.status == Pending => held.amount,
        (Some(_), _) => 0,
    }
}

/// Signed balance change caused by a deposit event.
///
/// Pending deposits are recorded without credit; the net amount is credited
/// once, when the deposit first becomes successful.
pub fn deposit_delta(
    existing: Option<LedgerSnapshot>,
    incoming: IncomingEvent,
    amount_to_credit: i64,
) -> i64 {
    use CardTransactionStatus::*;

    match (existing, incoming.status) {
        (None, Successful) => amount_to_credit,
        (Some(held), Successful) if held.status == Pending => amount_to_credit,
        _ => 0,
    }
}

/// Spend authorization decision. Performs no writes.
pub fn authorize_spend(card: &Card, amount: i64) -> Result<(), Rejection> {
    if card.status != CardStatus::Active {
        return Err(Rejection::CardNotActive);
    }
    if card.balance < amount {
        return Err(Rejection::InsufficientBalance);
    }
    Ok(())
}

/// The card must belong to the card-user resolved for the event.
pub fn ensure_card_owner(card: &Card, card_user: &CardUser) -> Result<(), Rejection> {
    if card.card_user_id != card_user.id || card.user_id != card_user.user_id {
        tracing::error!(
            card_id = %card.id,
            card_user_id = %card_user.id,
            "Card does not belong to the resolved card user"
        );
        return Err(Rejection::UnauthorizedCardAccess);
    }
    Ok(())
}
