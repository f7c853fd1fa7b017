use anyhow::Context;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 authenticity check for inbound webhook payloads.
///
/// Verification runs over the exact raw body bytes as received, so any
/// re-serialization difference on the sender side is the sender's problem,
/// not a source of false negatives here.
pub struct WebhookSigner {
    secret: Option<String>,
}

impl WebhookSigner {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        if secret.is_none() {
            tracing::warn!("webhook secret not configured, all webhook deliveries will be rejected");
        }
        Self { secret }
    }

    /// Checks `signature` (optionally `sha256=`-prefixed hex) against the
    /// payload. A missing secret is an authorization error, never a pass.
    pub fn verify(&self, signature: &str, payload: &[u8]) -> Result<bool, WebhookError> {
        let secret = self.secret()?;

        let clean = signature.strip_prefix("sha256=").unwrap_or(signature);
        let Ok(provided) = hex::decode(clean) else {
            return Ok(false);
        };

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .context("failed to initialize webhook hmac")?;
        mac.update(payload);
        // verify_slice is constant-time; never compare digests with ==.
        Ok(mac.verify_slice(&provided).is_ok())
    }

    /// Produces a hex signature for a payload. Test/ops tooling only.
    pub fn generate(&self, payload: &[u8]) -> Result<String, WebhookError> {
        let secret = self.secret()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .context("failed to initialize webhook hmac")?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn secret(&self) -> Result<&str, WebhookError> {
        self.secret
            .as_deref()
            .ok_or_else(|| WebhookError::Unauthorized("Webhook secret not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> WebhookSigner {
        WebhookSigner::new(Some("test-secret".to_string()))
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let signer = signer();
        let payload = br#"{"txHash":"0xabc","blockNumber":10}"#;
        let signature = signer.generate(payload).unwrap();
        assert!(signer.verify(&signature, payload).unwrap());
        assert!(signer.verify(&format!("sha256={signature}"), payload).unwrap());
    }

    #[test]
    fn payload_mutation_fails_verification() {
        let signer = signer();
        let payload = br#"{"txHash":"0xabc","blockNumber":10}"#;
        let signature = signer.generate(payload).unwrap();
        let tampered = br#"{"txHash":"0xabd","blockNumber":10}"#;
        assert!(!signer.verify(&signature, tampered).unwrap());
    }

    #[test]
    fn signature_mutation_fails_verification() {
        let signer = signer();
        let payload = b"payload";
        let mut signature = signer.generate(payload).unwrap();
        // Flip one hex digit.
        let last = signature.pop().unwrap();
        signature.push(if last == '0' { '1' } else { '0' });
        assert!(!signer.verify(&signature, payload).unwrap());
    }

    #[test]
    fn garbage_signature_is_invalid_not_an_error() {
        let signer = signer();
        assert!(!signer.verify("not-hex!", b"payload").unwrap());
    }

    #[test]
    fn missing_secret_is_an_authorization_error() {
        let signer = WebhookSigner::new(None);
        let err = signer.verify("deadbeef", b"payload").unwrap_err();
        assert!(matches!(err, WebhookError::Unauthorized(_)));
        let err = signer.generate(b"payload").unwrap_err();
        assert!(matches!(err, WebhookError::Unauthorized(_)));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let signature = signer().generate(b"payload").unwrap();
        let other = WebhookSigner::new(Some("other-secret".to_string()));
        assert!(!other.verify(&signature, b"payload").unwrap());
    }
}
