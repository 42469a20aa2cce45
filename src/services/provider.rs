//! Card provider REST client.
//!
//! The core only needs two outbound calls:
//! - create a charge against a provider user (fee collection)
//! - change a card's status (lock after repeated declines)
//!
//! Both are best-effort from the engine's point of view: failures are
//! logged by the caller and never roll back committed balances.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Receipt of a successful charge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChargeReceipt {
    /// Provider charge id, stored as the fee settlement reference
    #[serde(rename = "id")]
    pub provider_ref: String,
}

/// Card status values the provider accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCardStatusUpdate {
    Locked,
}

#[async_trait]
pub trait CardProvider: Send + Sync {
    /// Charge `amount_minor` to a provider user.
    ///
    /// `idempotency_key` makes retries of the same charge safe.
    async fn create_charge(
        &self,
        provider_user_ref: &str,
        amount_minor: i64,
        description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeReceipt, ProviderError>;

    async fn update_card_status(
        &self,
        provider_card_ref: &str,
        status: ProviderCardStatusUpdate,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    amount: i64,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct CardStatusRequest {
    status: ProviderCardStatusUpdate,
}

/// `CardProvider` over HTTPS.
///
/// # Headers Sent
///
/// - `Api-Key: <key>`
/// - `Idempotency-Key: <key>` on charges
///
/// # Timeout
///
/// 10 seconds per call
pub struct HttpCardProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCardProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CardProvider for HttpCardProvider {
    async fn create_charge(
        &self,
        provider_user_ref: &str,
        amount_minor: i64,
        description: &str,
        idempotency_key: &str,
    ) -> Result<ChargeReceipt, ProviderError> {
        let url = format!("{}/issuing/users/{}/charges", self.base_url, provider_user_ref);

        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&ChargeRequest {
                amount: amount_minor,
                description,
            })
            .send()
            .await?;

        let receipt = Self::check(response).await?.json::<ChargeReceipt>().await?;
        Ok(receipt)
    }

    async fn update_card_status(
        &self,
        provider_card_ref: &str,
        status: ProviderCardStatusUpdate,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/issuing/cards/{}", self.base_url, provider_card_ref);

        let response = self
            .client
            .patch(&url)
            .header("Api-Key", &self.api_key)
            .json(&CardStatusRequest { status })
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
