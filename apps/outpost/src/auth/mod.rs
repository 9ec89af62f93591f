//! Freshness and signature checks for inbound `command` directives.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use time::OffsetDateTime;
use tracing::{error, warn};

mod error;

pub use error::VerifyError;

/// Oldest acceptable directive, in seconds behind the local clock.
pub const MAX_DIRECTIVE_AGE_SECS: i64 = 60;
/// Clock skew tolerated for directives stamped ahead of the local clock.
pub const MAX_CLOCK_SKEW_SECS: i64 = 10;

/// Holds the trust anchor and decides whether a command may run.
///
/// A verifier built from a missing or malformed key stays constructible but
/// rejects every directive.
#[derive(Debug, Clone)]
pub struct DirectiveVerifier {
    key: Option<VerifyingKey>,
}

impl DirectiveVerifier {
    /// Parses a base64 encoded Ed25519 public key.
    pub fn from_base64(encoded: &str) -> Self {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            warn!("no trust anchor configured; every command will be rejected");
            return Self { key: None };
        }
        let bytes = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "trust anchor is not valid base64; every command will be rejected");
                return Self { key: None };
            }
        };
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let Ok(raw) = <[u8; PUBLIC_KEY_LENGTH]>::try_from(bytes) else {
            warn!(
                expected = PUBLIC_KEY_LENGTH,
                found = bytes.len(),
                "trust anchor has the wrong size; every command will be rejected"
            );
            return Self { key: None };
        };
        match VerifyingKey::from_bytes(&raw) {
            Ok(key) => Self { key: Some(key) },
            Err(err) => {
                warn!(error = %err, "trust anchor is not a valid Ed25519 key; every command will be rejected");
                Self { key: None }
            }
        }
    }

    pub fn has_trust_anchor(&self) -> bool {
        self.key.is_some()
    }

    /// Returns `true` only for fresh directives signed by the trust anchor.
    /// Rejections are logged at error level.
    pub fn verify(&self, content: &str, timestamp: i64, signature: &str) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        match self.check(content, timestamp, signature, now) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, timestamp, "rejecting command directive");
                false
            }
        }
    }

    pub fn check(
        &self,
        content: &str,
        timestamp: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), VerifyError> {
        let key = self.key.as_ref().ok_or(VerifyError::NoTrustAnchor)?;

        let age_secs = now.saturating_sub(timestamp);
        if age_secs > MAX_DIRECTIVE_AGE_SECS {
            return Err(VerifyError::Expired { age_secs });
        }
        if timestamp > now.saturating_add(MAX_CLOCK_SKEW_SECS) {
            return Err(VerifyError::FromFuture {
                ahead_secs: timestamp.saturating_sub(now),
            });
        }

        let signature = STANDARD
            .decode(signature)
            .map_err(|_| VerifyError::SignatureEncoding)?;
        let signature =
            Signature::from_slice(&signature).map_err(|_| VerifyError::BadSignature)?;

        key.verify(signed_payload(timestamp, content).as_bytes(), &signature)
            .map_err(|_| VerifyError::BadSignature)
    }
}

/// Byte string the control server signs for a command directive.
pub fn signed_payload(timestamp: i64, content: &str) -> String {
    format!("{timestamp}:{content}")
}
