//! Insufficient-funds decline tracking.
//!
//! Every declined spend whose reason reads as insufficient funds bumps the
//! card's decline counter inside the same store transaction as the decline
//! write. Reaching the threshold blocks the card locally; the provider-side
//! lock is requested after commit and may fail without undoing the block.
//! A successful spend resets the counter (see `update_card_balance`).

use uuid::Uuid;

use crate::{
    db::StoreTransaction,
    error::EngineError,
    models::card::{Card, CardStatus},
    services::provider::{CardProvider, ProviderCardStatusUpdate},
};

/// Decline reasons treated as insufficient funds, compared lowercase.
const INSUFFICIENT_FUNDS_PATTERNS: &[&str] = &["insufficient funds", "credit limit exceeded"];

/// Whether a provider decline reason means the card ran out of funds.
pub fn is_insufficient_funds(reason: Option<&str>) -> bool {
    let Some(reason) = reason else {
        return false;
    };
    let reason = reason.to_lowercase();
    INSUFFICIENT_FUNDS_PATTERNS
        .iter()
        .any(|pattern| reason.contains(pattern))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclinePolicy {
    /// Consecutive insufficient-funds declines that block a card
    pub block_threshold: i32,
}

impl Default for DeclinePolicy {
    fn default() -> Self {
        Self { block_threshold: 5 }
    }
}

/// Effect of one counted decline.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclineRecord {
    /// Card as written by this decline
    pub card: Card,

    /// Whether this decline is the one that blocked the card
    pub newly_blocked: bool,
}

impl DeclinePolicy {
    /// Count a decline against `card_id` within `tx`, blocking the card at the threshold.
    pub async fn record_decline(
        &self,
        tx: &mut dyn StoreTransaction,
        card_id: Uuid,
    ) -> Result<DeclineRecord, EngineError> {
        let card = tx
            .increment_decline_count(card_id)
            .await?
            .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                entity: "card",
                id: card_id,
            })?;

        let decline_count = card.insufficient_funds_decline_count;
        if decline_count < self.block_threshold || card.status == CardStatus::Blocked {
            return Ok(DeclineRecord {
                card,
                newly_blocked: false,
            });
        }

        let blocked = tx
            .update_card_status(card_id, CardStatus::Blocked)
            .await?
            .ok_or(EngineError::NotFoundDuringBalanceUpdate {
                entity: "card",
                id: card_id,
            })?;

        tracing::warn!(
            card_id = %card_id,
            decline_count,
            "Card blocked after repeated insufficient funds declines"
        );

        Ok(DeclineRecord {
            card: blocked,
            newly_blocked: true,
        })
    }
}

/// Ask the provider to lock a card blocked locally.
///
/// Best-effort: the local block stands whatever the provider answers.
pub async fn lock_at_provider(provider: &dyn CardProvider, card: &Card) -> bool {
    match provider
        .update_card_status(&card.provider_ref, ProviderCardStatusUpdate::Locked)
        .await
    {
        Ok(()) => {
            tracing::info!(card_id = %card.id, "Card locked at provider");
            true
        }
        Err(e) => {
            tracing::warn!(
                card_id = %card.id,
                error = %e,
                "Failed to lock card at provider, local block stands"
            );
            false
        }
    }
}
