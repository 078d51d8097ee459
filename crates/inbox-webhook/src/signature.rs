//! Webhook signature handling
//!
//! `X-Webhook-Signature` carries the lower-case hex HMAC-SHA256 of the exact
//! request body, keyed by the webhook's own secret.

use crate::{Result, WebhookError};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";

/// Header names tenants may not set on their webhooks.
pub const RESERVED_HEADERS: [&str; 6] = [
    SIGNATURE_HEADER,
    EVENT_ID_HEADER,
    EVENT_TYPE_HEADER,
    "Content-Type",
    "Content-Length",
    "Host",
];

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name.trim()))
}

fn mac(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::Configuration(format!("invalid signing key: {}", e)))
}

/// Signs request bodies with one webhook's secret
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl WebhookSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Hex signature over `payload`
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let mut mac = mac(&self.secret)?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Receiver-side verification
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Verify a hex signature in constant time.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<()> {
        let expected = hex::decode(signature.trim()).map_err(|_| {
            WebhookError::SignatureVerificationFailed("signature is not valid hex".to_string())
        })?;

        let mut mac = mac(&self.secret)?;
        mac.update(payload);
        mac.verify_slice(&expected).map_err(|_| {
            WebhookError::SignatureVerificationFailed("signature mismatch".to_string())
        })
    }
}

/// Generate a secure random webhook secret (32 bytes of entropy)
pub fn generate_webhook_secret() -> String {
    let secret: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(secret))
}
