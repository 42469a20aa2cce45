//! Ledger line models.
//!
//! This module defines:
//! - `CardTransaction`: provider-scoped ledger line, one per provider reference
//! - `MainTransaction`: user-facing journal entry sharing the same reference
//! - The status vocabularies of both layers and the mapping between them
//!
//! # Status Machine
//!
//! ```text
//! pending -> successful | declined | canceled
//! ```
//!
//! Terminal states never move again.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a `CardTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardTransactionStatus {
    Pending,
    Successful,
    Declined,
    Canceled,
}

impl CardTransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardTransactionStatus::Pending => "pending",
            CardTransactionStatus::Successful => "successful",
            CardTransactionStatus::Declined => "declined",
            CardTransactionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CardTransactionStatus::Pending)
    }

    /// Journal status for the user-facing ledger.
    pub fn to_main_status(self) -> MainTransactionStatus {
        match self {
            CardTransactionStatus::Pending => MainTransactionStatus::Pending,
            CardTransactionStatus::Successful => MainTransactionStatus::Completed,
            CardTransactionStatus::Declined => MainTransactionStatus::Declined,
            CardTransactionStatus::Canceled => MainTransactionStatus::Canceled,
        }
    }
}

impl fmt::Display for CardTransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardTransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CardTransactionStatus::Pending),
            "successful" => Ok(CardTransactionStatus::Successful),
            "declined" => Ok(CardTransactionStatus::Declined),
            "canceled" => Ok(CardTransactionStatus::Canceled),
            other => Err(format!("unknown card transaction status '{other}'")),
        }
    }
}

/// Status of a `MainTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MainTransactionStatus {
    Pending,
    Completed,
    Declined,
    Canceled,
}

impl MainTransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MainTransactionStatus::Pending => "pending",
            MainTransactionStatus::Completed => "completed",
            MainTransactionStatus::Declined => "declined",
            MainTransactionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MainTransactionStatus::Pending)
    }
}

impl FromStr for MainTransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MainTransactionStatus::Pending),
            "completed" => Ok(MainTransactionStatus::Completed),
            "declined" => Ok(MainTransactionStatus::Declined),
            "canceled" => Ok(MainTransactionStatus::Canceled),
            other => Err(format!("unknown main transaction status '{other}'")),
        }
    }
}

/// Class of a ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Spend,
    Deposit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Spend => "spend",
            TransactionKind::Deposit => "deposit",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spend" => Ok(TransactionKind::Spend),
            "deposit" => Ok(TransactionKind::Deposit),
            other => Err(format!("unknown transaction kind '{other}'")),
        }
    }
}

/// Merchant details attached to spend lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MerchantInfo {
    pub name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub category: Option<String>,
    pub category_code: Option<String>,
}

/// Ledger line scoped to one card.
///
/// # Database Table
///
/// Maps to the `card_transactions` table. `provider_ref` is unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardTransaction {
    pub id: Uuid,
    pub card_id: Uuid,
    pub card_user_id: Uuid,
    pub user_id: Uuid,

    /// Provider idempotency key of the event
    pub provider_ref: String,

    pub kind: TransactionKind,
    pub status: CardTransactionStatus,

    /// Gross amount in minor units
    pub amount: i64,
    pub fee: i64,
    pub currency: String,

    /// Card balance snapshot around the mutation
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,

    pub merchant: MerchantInfo,
    pub decline_reason: Option<String>,

    /// Charge reference returned by the provider once the fee is collected
    pub fee_provider_ref: Option<String>,
    pub fee_settled: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for `CardTransaction`.
#[derive(Debug, Clone)]
pub struct NewCardTransaction {
    pub card_id: Uuid,
    pub card_user_id: Uuid,
    pub user_id: Uuid,
    pub provider_ref: String,
    pub kind: TransactionKind,
    pub status: CardTransactionStatus,
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub merchant: MerchantInfo,
    pub decline_reason: Option<String>,
    pub fee_settled: bool,
}

/// Update payload for `CardTransaction`. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct CardTransactionPatch {
    pub status: Option<CardTransactionStatus>,
    pub amount: Option<i64>,
    pub fee: Option<i64>,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub decline_reason: Option<String>,
    pub fee_settled: Option<bool>,
}

/// User-facing journal entry.
///
/// # Database Table
///
/// Maps to the `main_transactions` table. `reference` equals the
/// provider reference of the correlated `CardTransaction`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MainTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reference: String,
    pub kind: TransactionKind,
    pub status: MainTransactionStatus,
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,

    /// Free-form display data (destination name, card last four, ...)
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for `MainTransaction`.
#[derive(Debug, Clone)]
pub struct NewMainTransaction {
    pub user_id: Uuid,
    pub reference: String,
    pub kind: TransactionKind,
    pub status: MainTransactionStatus,
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub metadata: serde_json::Value,
}

/// Update payload for `MainTransaction`.
#[derive(Debug, Clone, Default)]
pub struct MainTransactionPatch {
    pub status: Option<MainTransactionStatus>,
    pub amount: Option<i64>,
    pub fee: Option<i64>,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
}

/// Maps a blockchain deposit address to the user funding a card-user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositAddress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chain_id: i64,
    pub address: String,
    pub created_at: DateTime<Utc>,
}
