//! Post-commit notifications.
//!
//! Two kinds of outbound messages leave the engine once a balance
//! transaction has committed:
//! - card notifications (spend and deposit activity, card blocked)
//! - `wallet_balance_changed` events carrying previous and new balance
//!
//! Delivery is best-effort. Callers log failures and carry on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::Sha256;
use uuid::Uuid;

use crate::{
    error::ProviderError,
    models::{
        card::Card,
        ledger::{CardTransaction, CardTransactionStatus, TransactionKind},
    },
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SpendPending,
    SpendCompleted,
    SpendDeclined,
    SpendReversed,
    DepositReceived,
    CardBlocked,
}

impl NotificationKind {
    /// Notification for a committed ledger line, if its state is worth telling the user.
    pub fn for_line(line: &CardTransaction) -> Option<Self> {
        match (line.kind, line.status) {
            (TransactionKind::Spend, CardTransactionStatus::Pending) => Some(Self::SpendPending),
            (TransactionKind::Spend, CardTransactionStatus::Successful) => {
                Some(Self::SpendCompleted)
            }
            (TransactionKind::Spend, CardTransactionStatus::Declined) => Some(Self::SpendDeclined),
            (TransactionKind::Spend, CardTransactionStatus::Canceled) => Some(Self::SpendReversed),
            (TransactionKind::Deposit, CardTransactionStatus::Successful) => {
                Some(Self::DepositReceived)
            }
            (TransactionKind::Deposit, _) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
    InApp,
}

/// Default channels per notification kind.
pub fn channels_for(kind: NotificationKind) -> &'static [Channel] {
    match kind {
        NotificationKind::SpendPending => &[Channel::InApp],
        NotificationKind::CardBlocked => &[Channel::Email, Channel::Push, Channel::InApp],
        _ => &[Channel::Push, Channel::InApp],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardNotification {
    pub kind: NotificationKind,
    pub user_id: Uuid,
    pub card_id: Uuid,
    pub transaction_ref: Option<String>,
    pub amount: Option<i64>,
    pub currency: String,
    pub card_last_four: Option<String>,
    pub merchant_name: Option<String>,
    pub reason: Option<String>,
}

impl CardNotification {
    pub fn for_line(kind: NotificationKind, card: &Card, line: &CardTransaction) -> Self {
        Self {
            kind,
            user_id: line.user_id,
            card_id: card.id,
            transaction_ref: Some(line.provider_ref.clone()),
            amount: Some(line.amount),
            currency: line.currency.clone(),
            card_last_four: card.last_four.clone(),
            merchant_name: line.merchant.name.clone(),
            reason: line.decline_reason.clone(),
        }
    }

    pub fn card_blocked(card: &Card, currency: &str) -> Self {
        Self {
            kind: NotificationKind::CardBlocked,
            user_id: card.user_id,
            card_id: card.id,
            transaction_ref: None,
            amount: None,
            currency: currency.to_string(),
            card_last_four: card.last_four.clone(),
            merchant_name: None,
            reason: Some("insufficient_funds_declines".to_string()),
        }
    }
}

/// `wallet_balance_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChanged {
    pub user_id: Uuid,
    pub wallet_type: &'static str,
    pub wallet_id: Uuid,
    pub currency: String,
    pub balance: i64,
    pub previous_balance: i64,
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub wallet: Value,
}

impl BalanceChanged {
    /// Build the event for a card after `line` changed its balance by `delta`.
    pub fn for_card(card: &Card, line: &CardTransaction, delta: i64) -> Self {
        let (previous_balance, balance) =
            balance_transition(line.balance_before, line.balance_after, card.balance, delta);

        Self {
            user_id: card.user_id,
            wallet_type: "card",
            wallet_id: card.id,
            currency: line.currency.clone(),
            balance,
            previous_balance,
            transaction_id: line.provider_ref.clone(),
            timestamp: Utc::now(),
            wallet: json!({
                "id": card.id,
                "status": card.status,
                "lastFour": card.last_four,
                "balance": balance,
            }),
        }
    }
}

/// `(previous, new)` balance around a mutation.
///
/// Uses the stored snapshot when present, else derives it from the
/// current balance and the applied delta.
pub fn balance_transition(
    before: Option<i64>,
    after: Option<i64>,
    current: i64,
    delta: i64,
) -> (i64, i64) {
    let new_balance = after.unwrap_or(current);
    let previous = before.unwrap_or(new_balance - delta);
    (previous, new_balance)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_card_notification(
        &self,
        channels: &[Channel],
        notification: &CardNotification,
    ) -> Result<(), ProviderError>;

    async fn emit_balance_changed(&self, event: &BalanceChanged) -> Result<(), ProviderError>;
}

/// Notifier POSTing signed JSON messages to one endpoint.
///
/// # Headers Sent
///
/// - `Content-Type: application/json`
/// - `X-Webhook-Signature: sha256=<hex>` (when a secret is configured)
/// - `X-Webhook-Event-Id: <uuid>`
///
/// # Timeout
///
/// 5 seconds per message
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, secret: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            secret,
        })
    }

    async fn post(&self, event_type: &str, data: Value) -> Result<(), ProviderError> {
        let event_id = Uuid::new_v4();
        let payload = serde_json::to_string(&json!({
            "id": event_id,
            "type": event_type,
            "data": data,
        }))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event-Id", event_id.to_string());
        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Signature", generate_signature(secret, &payload));
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(event_id = %event_id, event_type, "Notification delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_card_notification(
        &self,
        channels: &[Channel],
        notification: &CardNotification,
    ) -> Result<(), ProviderError> {
        self.post(
            "card_notification",
            json!({ "channels": channels, "notification": notification }),
        )
        .await
    }

    async fn emit_balance_changed(&self, event: &BalanceChanged) -> Result<(), ProviderError> {
        self.post("wallet_balance_changed", serde_json::to_value(event)?)
            .await
    }
}

/// Notifier that only logs, used when no endpoint is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_card_notification(
        &self,
        channels: &[Channel],
        notification: &CardNotification,
    ) -> Result<(), ProviderError> {
        tracing::info!(
            kind = ?notification.kind,
            user_id = %notification.user_id,
            card_id = %notification.card_id,
            channels = ?channels,
            "Card notification"
        );
        Ok(())
    }

    async fn emit_balance_changed(&self, event: &BalanceChanged) -> Result<(), ProviderError> {
        tracing::info!(
            user_id = %event.user_id,
            wallet_id = %event.wallet_id,
            previous_balance = event.previous_balance,
            balance = event.balance,
            transaction_ref = %event.transaction_id,
            "Wallet balance changed"
        );
        Ok(())
    }
}

/// Generate HMAC-SHA256 signature for a notification payload.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
fn generate_signature(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    format!("sha256={}", hex::encode(result.into_bytes()))
}
