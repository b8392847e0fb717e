//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::WebhookError;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Check `sha256=<hex>` against an HMAC-SHA256 of the raw body, in constant time.
pub fn verify_signature(
    app_secret: &SecretString,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), WebhookError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WebhookError::SignatureInvalid("missing signature header".into()))?;
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header).trim();
    let expected = hex::decode(hex_sig)
        .map_err(|_| WebhookError::SignatureInvalid("signature is not hex".into()))?;

    let mut mac = keyed_mac(app_secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureInvalid("signature mismatch".into()))
}

/// Header value the platform would send for `body`.
pub fn sign(app_secret: &SecretString, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = keyed_mac(app_secret)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Compare a presented token with the configured one without leaking the
/// matching prefix length through timing. Both sides are MACed under their own
/// token and the tags compared with `verify_slice`.
pub fn token_matches(expected: &SecretString, provided: &str) -> bool {
    let (Ok(mut ours), Ok(mut theirs)) = (
        keyed_mac(expected),
        Hmac::<Sha256>::new_from_slice(provided.as_bytes()),
    ) else {
        return false;
    };
    ours.update(b"hub.verify_token");
    theirs.update(b"hub.verify_token");
    ours.verify_slice(&theirs.finalize().into_bytes()).is_ok()
}

fn keyed_mac(app_secret: &SecretString) -> Result<Hmac<Sha256>, WebhookError> {
    Hmac::<Sha256>::new_from_slice(app_secret.expose_secret().as_bytes())
        .map_err(|e| WebhookError::SignatureInvalid(e.to_string()))
}
