//! Provider webhook signature verification.
//!
//! This middleware intercepts every webhook delivery to:
//! 1. Read the `signature` header
//! 2. Buffer the raw body
//! 3. Compare HMAC-SHA256(secret, body) against the header in constant time
//! 4. Reject mismatches with HTTP 401 before the body reaches the router

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{error::AppError, handlers::AppState};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded body signature.
pub const SIGNATURE_HEADER: &str = "signature";

/// Largest webhook body accepted.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Signature verification middleware function.
///
/// # Headers
///
/// Expected header format (an optional `sha256=` prefix is accepted):
/// ```text
/// signature: 5d41402abc4b2a76b9719d911017c592...
/// ```
///
/// # Returns
///
/// - `Ok(Response)` from the next handler when the signature matches
/// - `Err(AppError::InvalidSignature)` when it is missing or wrong (401)
pub async fn verify_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::InvalidSignature)?
        .to_string();

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError::InvalidRequest(format!("Unreadable body: {e}")))?;

    if let Err(e) = verify(state.signing_secret.as_bytes(), &bytes, &signature) {
        tracing::warn!("Rejected webhook with invalid signature");
        return Err(e);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Check `signature` (hex) against HMAC-SHA256(`secret`, `body`).
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> Result<(), AppError> {
    let signature = signature.trim();
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = hex::decode(hex_digest).map_err(|_| AppError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AppError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AppError::InvalidSignature)
}

/// Hex HMAC-SHA256 of `body`, as the provider computes it.
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
