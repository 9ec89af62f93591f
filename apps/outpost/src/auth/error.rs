use thiserror::Error;

/// Reasons a command directive is refused. None of these ever reach the
/// server; they only surface in the agent's own log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("no valid trust anchor configured")]
    NoTrustAnchor,
    #[error("directive expired ({age_secs}s old)")]
    Expired { age_secs: i64 },
    #[error("directive timestamp is {ahead_secs}s in the future")]
    FromFuture { ahead_secs: i64 },
    #[error("signature is not valid base64")]
    SignatureEncoding,
    #[error("signature does not match directive")]
    BadSignature,
}
