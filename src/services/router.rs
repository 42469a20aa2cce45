//! Webhook event router.
//!
//! Classifies an envelope by `(resource, action)`, normalises its body and
//! hands it to the matching handler. Every path ends in a `WebhookOutcome`;
//! the only error that escapes is a retryable infrastructure failure.
//!
//! # Dispatch Table
//!
//! | resource      | action                          | handler                   |
//! |---------------|---------------------------------|---------------------------|
//! | `transaction` | `requested`                     | spend authorization       |
//! | `transaction` | `created`, `updated`, `completed` | spend / collateral ledger |
//! | `card`        | `updated`                       | card profile              |
//! | `user`        | `created`, `updated`            | application status        |
//! | `contract`    | `created`, `updated`            | deposit address           |
//! | `dispute`     | any                             | ignored                   |

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::{EngineError, Rejection},
    models::webhook::{
        CardEvent, ContractEvent, OutcomeStatus, TransactionEvent, UserEvent, WebhookEnvelope,
        WebhookOutcome, normalize_body,
    },
    services::{
        profiles::ProfileService,
        reconciliation::{Authorization, LedgerOutcome, ReconciliationEngine},
    },
};

/// Error text returned for fatal failures. Internal detail is only logged.
pub const INTERNAL_PROCESSING_ERROR: &str = "Internal processing error";

pub struct EventRouter {
    engine: Arc<ReconciliationEngine>,
    profiles: ProfileService,
}

impl EventRouter {
    pub fn new(engine: Arc<ReconciliationEngine>, profiles: ProfileService) -> Self {
        Self { engine, profiles }
    }

    /// Route one event.
    ///
    /// # Errors
    ///
    /// Only errors for which `EngineError::is_retryable` holds. Every other
    /// failure is folded into `{status: processed, error}`.
    pub async fn dispatch(&self, envelope: WebhookEnvelope) -> Result<WebhookOutcome, EngineError> {
        let WebhookEnvelope {
            id,
            resource,
            action,
            mut body,
        } = envelope;
        normalize_body(&mut body);

        tracing::debug!(event_id = %id, resource = %resource, action = %action, "Routing webhook");

        let result = match resource.as_str() {
            "transaction" => self.on_transaction(&action, body).await,
            "card" => self.on_card(&action, body).await,
            "user" => self.on_user(&action, body).await,
            "contract" => self.on_contract(&action, body).await,
            "dispute" => Ok(WebhookOutcome::ignored(&action, "dispute_not_handled")),
            _ => Ok(WebhookOutcome::ignored(&action, "unknown_resource")),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => {
                tracing::warn!(event_id = %id, error = %e, "Retryable failure processing webhook");
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %id,
                    resource = %resource,
                    action = %action,
                    error = %e,
                    "Webhook processing failed"
                );
                Ok(WebhookOutcome::processed(&action).with("error", INTERNAL_PROCESSING_ERROR))
            }
        }
    }

    async fn on_transaction(&self, action: &str, body: Value) -> Result<WebhookOutcome, EngineError> {
        if !matches!(action, "requested" | "created" | "updated" | "completed") {
            return Ok(WebhookOutcome::ignored(action, "unknown_action"));
        }
        let Some(event) = parse::<TransactionEvent>(body) else {
            return Ok(invalid_payload(action));
        };

        match (action, event.kind.as_str()) {
            ("requested", "spend") => {
                let Some(spend) = &event.spend else {
                    return Ok(invalid_payload(action));
                };
                Ok(match self.engine.authorize_spend(spend).await? {
                    Authorization::Approved { .. } => {
                        WebhookOutcome::new(OutcomeStatus::Approved, action).with("authorized", true)
                    }
                    Authorization::Rejected(rejection) => {
                        WebhookOutcome::new(OutcomeStatus::Rejected, action)
                            .with("authorized", false)
                            .with("reason", rejection.as_str())
                    }
                })
            }
            (_, "spend") => {
                let Some(spend) = &event.spend else {
                    return Ok(invalid_payload(action));
                };
                let outcome = self.engine.apply_spend(&event.id, spend).await?;
                Ok(ledger_outcome(action, &event.id, outcome))
            }
            ("requested", _) => Ok(WebhookOutcome::ignored(action, "unsupported_transaction_type")),
            (_, "collateral") => {
                let Some(collateral) = &event.collateral else {
                    return Ok(invalid_payload(action));
                };
                let outcome = self.engine.apply_collateral(&event.id, collateral).await?;
                Ok(ledger_outcome(action, &event.id, outcome))
            }
            _ => Ok(WebhookOutcome::ignored(action, "unsupported_transaction_type")),
        }
    }

    async fn on_card(&self, action: &str, body: Value) -> Result<WebhookOutcome, EngineError> {
        if action != "updated" {
            return Ok(WebhookOutcome::ignored(action, "unknown_action"));
        }
        let Some(event) = parse::<CardEvent>(body) else {
            return Ok(invalid_payload(action));
        };

        Ok(match self.profiles.apply_card_update(&event).await? {
            Ok(card) => WebhookOutcome::processed(action)
                .with("cardId", card.id.to_string())
                .with("cardStatus", card.status.as_str()),
            Err(rejection) => rejected(action, rejection),
        })
    }

    async fn on_user(&self, action: &str, body: Value) -> Result<WebhookOutcome, EngineError> {
        if !matches!(action, "created" | "updated") {
            return Ok(WebhookOutcome::ignored(action, "unknown_action"));
        }
        let Some(event) = parse::<UserEvent>(body) else {
            return Ok(invalid_payload(action));
        };

        Ok(match self.profiles.apply_user_update(&event).await? {
            Ok(card_user) => WebhookOutcome::processed(action)
                .with("cardUserId", card_user.id.to_string())
                .with("applicationStatus", card_user.status),
            Err(rejection) => rejected(action, rejection),
        })
    }

    async fn on_contract(&self, action: &str, body: Value) -> Result<WebhookOutcome, EngineError> {
        if !matches!(action, "created" | "updated") {
            return Ok(WebhookOutcome::ignored(action, "unknown_action"));
        }
        let Some(event) = parse::<ContractEvent>(body) else {
            return Ok(invalid_payload(action));
        };

        Ok(match self.profiles.register_contract(&event).await? {
            Ok(address) => WebhookOutcome::processed(action)
                .with("chainId", address.chain_id)
                .with("depositAddress", address.address),
            Err(rejection) => rejected(action, rejection),
        })
    }
}

fn parse<T: DeserializeOwned>(body: Value) -> Option<T> {
    serde_json::from_value(body)
        .inspect_err(|e| tracing::warn!(error = %e, "Malformed webhook body"))
        .ok()
}

fn invalid_payload(action: &str) -> WebhookOutcome {
    WebhookOutcome::new(OutcomeStatus::Rejected, action).with("reason", "invalid_payload")
}

fn rejected(action: &str, rejection: Rejection) -> WebhookOutcome {
    WebhookOutcome::new(OutcomeStatus::Rejected, action).with("reason", rejection.as_str())
}

fn ledger_outcome(action: &str, transaction_ref: &str, outcome: LedgerOutcome) -> WebhookOutcome {
    match outcome {
        LedgerOutcome::Applied(applied) => WebhookOutcome::processed(action)
            .with("transactionId", transaction_ref)
            .with("transactionStatus", applied.line.status.as_str())
            .with("balanceBefore", applied.line.balance_before)
            .with("balanceAfter", applied.line.balance_after),
        LedgerOutcome::Duplicate => WebhookOutcome::processed(action)
            .with("transactionId", transaction_ref)
            .with("skipped", true)
            .with("reason", "transaction_already_processed"),
        LedgerOutcome::Rejected(rejection) => {
            rejected(action, rejection).with("transactionId", transaction_ref)
        }
    }
}
