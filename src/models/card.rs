//! Card and card-user data models.
//!
//! This module defines:
//! - `Card`: a provisioned payment instrument with its own balance
//! - `CardUser`: the provider-side aggregate owning one or more cards
//! - `CardStatus`: the local card lifecycle
//!
//! # Balance Storage
//!
//! Balances are stored as `i64` minor currency units (cents), never floats.
//! Only the reconciliation engine writes them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local card lifecycle.
///
/// Cards are never deleted. They move to `Canceled` or `Blocked` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Pending,
    Active,
    Inactive,
    Suspended,
    Blocked,
    Canceled,
    Expired,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Pending => "pending",
            CardStatus::Active => "active",
            CardStatus::Inactive => "inactive",
            CardStatus::Suspended => "suspended",
            CardStatus::Blocked => "blocked",
            CardStatus::Canceled => "canceled",
            CardStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CardStatus::Pending),
            "active" => Ok(CardStatus::Active),
            "inactive" => Ok(CardStatus::Inactive),
            "suspended" => Ok(CardStatus::Suspended),
            "blocked" => Ok(CardStatus::Blocked),
            "canceled" => Ok(CardStatus::Canceled),
            "expired" => Ok(CardStatus::Expired),
            other => Err(format!("unknown card status '{other}'")),
        }
    }
}

/// A provisioned payment instrument.
///
/// # Database Table
///
/// Maps to the `cards` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Card {
    pub id: Uuid,

    /// Platform user owning the card
    pub user_id: Uuid,

    /// Card-user aggregate the card belongs to
    pub card_user_id: Uuid,

    /// Card identifier assigned by the issuing provider
    pub provider_ref: String,

    pub status: CardStatus,

    /// Current balance in minor units, always `0..=MAX_SAFE_AMOUNT`
    pub balance: i64,

    pub spending_limit: Option<i64>,
    pub limit_frequency: Option<String>,
    pub is_frozen: bool,

    /// Consecutive insufficient-funds declines since the last successful spend
    pub insufficient_funds_decline_count: i32,

    pub expiration_month: Option<i16>,
    pub expiration_year: Option<i16>,
    pub last_four: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider-side identity aggregate.
///
/// Holds an aggregate balance mirrored against the balances of the cards
/// funded from its shared collateral.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardUser {
    pub id: Uuid,
    pub user_id: Uuid,

    /// User identifier assigned by the issuing provider
    pub provider_ref: String,

    /// Provider application status (`approved`, `pending`, `denied`, ...)
    pub status: String,

    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Changes applied by the `card.updated` webhook.
#[derive(Debug, Clone, Default)]
pub struct CardProfilePatch {
    pub status: Option<CardStatus>,
    pub is_frozen: Option<bool>,
    pub spending_limit: Option<i64>,
    pub limit_frequency: Option<String>,
    pub expiration_month: Option<i16>,
    pub expiration_year: Option<i16>,
    pub last_four: Option<String>,
    pub reset_decline_count: bool,
}
