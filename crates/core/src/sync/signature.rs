//! HMAC-SHA256 validation of webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded body signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Verifies webhook signatures against a shared secret. Without a secret,
/// every request is accepted.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);
        if secret.is_none() {
            log::warn!(
                "[ChangeRouter] no webhook secret configured: signature validation is DISABLED and unsigned change events will be accepted"
            );
        }
        Self { secret }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Hex signature for `body`, or `None` when validation is disabled.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `signature` (hex, optionally prefixed with `sha256=`) against
    /// the raw body in constant time.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let Some(secret) = self.secret.as_ref() else {
            return Ok(());
        };
        let provided = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Error::SignatureInvalid)?;
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        let expected = hex::decode(provided).map_err(|_| Error::SignatureInvalid)?;

        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|e| Error::Config(e.to_string()))?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| Error::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let verifier = SignatureVerifier::new(Some("s3cret".to_string()));
        let body = br#"{"event_type":"CREATE"}"#;
        let signature = verifier.sign(body).expect("enabled");
        assert!(verifier.verify(body, Some(&signature)).is_ok());
        assert!(verifier
            .verify(body, Some(&format!("sha256={}", signature)))
            .is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_missing_header() {
        let verifier = SignatureVerifier::new(Some("s3cret".to_string()));
        let signature = verifier.sign(b"original").expect("enabled");
        assert!(matches!(
            verifier.verify(b"tampered", Some(&signature)),
            Err(Error::SignatureInvalid)
        ));
        assert!(matches!(
            verifier.verify(b"original", None),
            Err(Error::SignatureInvalid)
        ));
        assert!(matches!(
            verifier.verify(b"original", Some("not-hex")),
            Err(Error::SignatureInvalid)
        ));
    }

    #[test]
    fn blank_secret_disables_validation() {
        let verifier = SignatureVerifier::new(Some("   ".to_string()));
        assert!(!verifier.is_enabled());
        assert!(verifier.verify(b"anything", None).is_ok());
        assert_eq!(verifier.sign(b"anything"), None);
    }
}
