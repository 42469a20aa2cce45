//! Inbound webhook models.
//!
//! This module defines the event envelope posted by the card provider,
//! the typed bodies of the events the router understands, the provider
//! status vocabularies, and the uniform result returned for every event.
//!
//! # Envelope
//!
//! ```json
//! {
//!   "id": "evt_123",
//!   "resource": "transaction",
//!   "action": "created",
//!   "body": { "id": "tx_1", "type": "spend", "spend": { "amount": 5000, "cardId": "card_1", "status": "pending" } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::ledger::{CardTransactionStatus, MerchantInfo};

/// Raw event as posted by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub body: Value,
}

/// Body of every `transaction.*` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    /// Provider transaction id, the ledger's idempotency key
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub spend: Option<SpendEvent>,
    pub collateral: Option<CollateralEvent>,
}

/// Card spend details.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendEvent {
    /// Amount in minor units as sent on the wire; validated before use
    pub amount: f64,
    pub currency: Option<String>,

    /// Provider card id
    pub card_id: String,

    /// Provider user id of the card-user
    pub user_id: Option<String>,

    #[serde(default)]
    pub status: ProviderSpendStatus,

    pub declined_reason: Option<String>,
    pub merchant_name: Option<String>,
    pub merchant_city: Option<String>,
    pub merchant_country: Option<String>,
    pub merchant_category: Option<String>,
    pub merchant_category_code: Option<String>,
}

impl SpendEvent {
    pub fn merchant(&self) -> MerchantInfo {
        MerchantInfo {
            name: self.merchant_name.clone(),
            city: self.merchant_city.clone(),
            country: self.merchant_country.clone(),
            category: self.merchant_category.clone(),
            category_code: self.merchant_category_code.clone(),
        }
    }
}

/// Collateral (funding) details.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollateralEvent {
    pub amount: f64,
    pub currency: Option<String>,

    /// Provider user id of the card-user, when known
    pub user_id: Option<String>,

    pub chain_id: Option<i64>,
    pub wallet_address: Option<String>,
    pub transaction_hash: Option<String>,

    #[serde(default)]
    pub status: ProviderCollateralStatus,
}

/// Spend status vocabulary used by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSpendStatus {
    #[default]
    Pending,
    Completed,
    Declined,
    Reversed,
}

/// Collateral status vocabulary used by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCollateralStatus {
    Pending,
    #[default]
    Completed,
    Failed,
    Canceled,
}

impl From<ProviderSpendStatus> for CardTransactionStatus {
    fn from(status: ProviderSpendStatus) -> Self {
        match status {
            ProviderSpendStatus::Pending => CardTransactionStatus::Pending,
            ProviderSpendStatus::Completed => CardTransactionStatus::Successful,
            ProviderSpendStatus::Declined => CardTransactionStatus::Declined,
            ProviderSpendStatus::Reversed => CardTransactionStatus::Canceled,
        }
    }
}

impl From<ProviderCollateralStatus> for CardTransactionStatus {
    fn from(status: ProviderCollateralStatus) -> Self {
        match status {
            ProviderCollateralStatus::Pending => CardTransactionStatus::Pending,
            ProviderCollateralStatus::Completed => CardTransactionStatus::Successful,
            ProviderCollateralStatus::Failed => CardTransactionStatus::Declined,
            ProviderCollateralStatus::Canceled => CardTransactionStatus::Canceled,
        }
    }
}

/// Card status vocabulary used by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderCardStatus {
    NotActivated,
    Active,
    Locked,
    Canceled,
}

impl ProviderCardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCardStatus::NotActivated => "notActivated",
            ProviderCardStatus::Active => "active",
            ProviderCardStatus::Locked => "locked",
            ProviderCardStatus::Canceled => "canceled",
        }
    }
}

/// Body of `card.updated`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardEvent {
    /// Provider card id
    pub id: String,
    pub status: Option<ProviderCardStatus>,
    pub limit: Option<CardLimit>,
    pub expiration_month: Option<Value>,
    pub expiration_year: Option<Value>,
    pub last4: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardLimit {
    pub amount: i64,
    pub frequency: Option<String>,
}

/// Body of `user.created` / `user.updated`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    /// Provider user id
    pub id: String,
    pub application_status: Option<String>,
}

/// Body of `contract.created` / `contract.updated`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEvent {
    pub id: String,

    /// Provider user id owning the collateral contract
    pub user_id: String,

    pub chain_id: i64,
    pub deposit_address: String,
}

/// Final disposition of one webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Processed,
    Approved,
    Rejected,
    Ignored,
}

/// Uniform handler result: `{status, action, ...fields}`.
///
/// # Example
///
/// ```json
/// { "status": "rejected", "action": "requested", "authorized": false, "reason": "insufficient_balance" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookOutcome {
    pub status: OutcomeStatus,
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WebhookOutcome {
    pub fn new(status: OutcomeStatus, action: impl Into<String>) -> Self {
        Self {
            status,
            action: action.into(),
            fields: Map::new(),
        }
    }

    pub fn processed(action: impl Into<String>) -> Self {
        Self::new(OutcomeStatus::Processed, action)
    }

    pub fn ignored(action: impl Into<String>, reason: &str) -> Self {
        Self::new(OutcomeStatus::Ignored, action).with("reason", reason)
    }

    /// Add a handler-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.fields.get("reason").and_then(Value::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }
}

/// Trim merchant/user text fields and null out blank ones.
///
/// Applies to keys starting with `merchant` or `user` and to everything
/// nested under such keys, at any depth of the body.
pub fn normalize_body(body: &mut Value) {
    normalize_value(body, false);
}

fn normalize_value(value: &mut Value, in_scope: bool) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let scoped = in_scope || is_person_or_merchant_key(key);
                normalize_value(child, scoped);
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_value(item, in_scope);
            }
        }
        Value::String(text) if in_scope => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                *value = Value::Null;
            } else if trimmed.len() != text.len() {
                *text = trimmed.to_string();
            }
        }
        _ => {}
    }
}

fn is_person_or_merchant_key(key: &str) -> bool {
    key.starts_with("merchant") || key.starts_with("user")
}
