//! Card, card-user and collateral contract updates.
//!
//! These events never touch balances. They keep the local copies of
//! provider state current: card status and limits, the card-user's
//! application status, and the deposit addresses used to resolve
//! collateral events.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    db::EntityStore,
    error::{EngineError, Rejection},
    models::{
        card::{Card, CardProfilePatch, CardStatus, CardUser},
        ledger::DepositAddress,
        webhook::{CardEvent, ContractEvent, ProviderCardStatus, UserEvent},
    },
};

/// Local status for a provider card status.
///
/// A card blocked locally stays blocked when the provider reports it locked.
pub fn map_card_status(provider: ProviderCardStatus, current: CardStatus) -> CardStatus {
    match provider {
        ProviderCardStatus::NotActivated => CardStatus::Pending,
        ProviderCardStatus::Active => CardStatus::Active,
        ProviderCardStatus::Locked if current == CardStatus::Blocked => CardStatus::Blocked,
        ProviderCardStatus::Locked => CardStatus::Suspended,
        ProviderCardStatus::Canceled => CardStatus::Canceled,
    }
}

/// Expiry fields arrive as numbers or numeric strings.
fn small_int(value: Option<&Value>) -> Option<i16> {
    match value? {
        Value::Number(n) => n.as_i64().and_then(|n| i16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build the patch for a `card.updated` event against the stored card.
pub fn card_patch(event: &CardEvent, current: &Card) -> CardProfilePatch {
    let mut patch = CardProfilePatch {
        expiration_month: small_int(event.expiration_month.as_ref()),
        expiration_year: small_int(event.expiration_year.as_ref()),
        last_four: event.last4.clone(),
        ..Default::default()
    };

    if let Some(limit) = &event.limit {
        patch.spending_limit = Some(limit.amount);
        patch.limit_frequency = limit.frequency.clone();
    }

    if let Some(provider_status) = event.status {
        let status = map_card_status(provider_status, current.status);
        patch.status = Some(status);
        patch.is_frozen = Some(provider_status == ProviderCardStatus::Locked);
        patch.reset_decline_count =
            status == CardStatus::Active && current.status != CardStatus::Active;
    }

    patch
}

pub struct ProfileService {
    store: Arc<dyn EntityStore>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn apply_card_update(
        &self,
        event: &CardEvent,
    ) -> Result<Result<Card, Rejection>, EngineError> {
        let Some(card) = self.store.find_card_by_provider_ref(&event.id).await? else {
            return Ok(Err(Rejection::CardNotFound));
        };

        let patch = card_patch(event, &card);
        let updated = self
            .store
            .update_card_profile(card.id, &patch)
            .await?
            .ok_or(Rejection::CardNotFound);

        if let Ok(updated) = &updated
            && updated.status != card.status
        {
            tracing::info!(
                card_id = %card.id,
                from = %card.status,
                to = %updated.status,
                "Card status updated from provider"
            );
        }
        Ok(updated)
    }

    pub async fn apply_user_update(
        &self,
        event: &UserEvent,
    ) -> Result<Result<CardUser, Rejection>, EngineError> {
        let Some(card_user) = self.store.find_card_user_by_provider_ref(&event.id).await? else {
            return Ok(Err(Rejection::CardUserNotFound));
        };

        let Some(status) = event.application_status.as_deref() else {
            return Ok(Ok(card_user));
        };

        Ok(self
            .store
            .update_card_user_status(card_user.id, status)
            .await?
            .ok_or(Rejection::CardUserNotFound))
    }

    /// Register the contract's deposit address for collateral lookups.
    pub async fn register_contract(
        &self,
        event: &ContractEvent,
    ) -> Result<Result<DepositAddress, Rejection>, EngineError> {
        let Some(card_user) = self
            .store
            .find_card_user_by_provider_ref(&event.user_id)
            .await?
        else {
            return Ok(Err(Rejection::CardUserNotFound));
        };

        let address = self
            .store
            .upsert_deposit_address(card_user.user_id, event.chain_id, &event.deposit_address)
            .await?;
        Ok(Ok(address))
    }
}
