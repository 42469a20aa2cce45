//! HTTP handler for card provider webhook deliveries.

use axum::{Json, body::Bytes, extract::State};

use crate::{
    error::AppError,
    handlers::AppState,
    models::webhook::{WebhookEnvelope, WebhookOutcome},
};

/// Accept one provider event.
///
/// # Request Body
///
/// ```json
/// {
///   "id": "evt_123",
///   "resource": "transaction",
///   "action": "completed",
///   "body": { "id": "tx_1", "type": "spend", "spend": { "amount": 5000, "cardId": "card_1", "status": "completed" } }
/// }
/// ```
///
/// # Response
///
/// - 200 with the event outcome for every processed, rejected or ignored event
/// - 400 when the body is not an envelope
/// - 401 when the signature does not match (see `middleware::signature`)
/// - 503 when a retryable failure stopped processing; the provider redelivers
pub async fn ingest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid webhook envelope: {e}")))?;

    let event_id = envelope.id.clone();
    tracing::debug!(
        event_id = %event_id,
        resource = %envelope.resource,
        action = %envelope.action,
        "Webhook received"
    );

    match state.router.dispatch(envelope).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            tracing::warn!(event_id = %event_id, error = %e, "Webhook processing failed, provider will retry");
            Err(AppError::Unavailable(e.to_string()))
        }
    }
}
