use thiserror::Error;

/// Error types
///
/// Cryptographic and integrity errors are terminal for a voting session.
/// Transport, timeout and storage errors can be retried in place.
#[derive(Debug, Error)]
pub enum Error {
    #[error("blindvote: configuration error: {0}")]
    Configuration(String),

    #[error("blindvote: stored nonce failed its integrity check")]
    Integrity,

    #[error("blindvote: invalid RSA key: {0}")]
    InvalidKey(String),

    #[error("blindvote: failed to unblind signature: {0}")]
    Unblind(String),

    #[error("blindvote: election authority signature did not verify")]
    SignatureVerification,

    #[error("blindvote: timed out after {0:?} waiting for the election authority")]
    Timeout(std::time::Duration),

    #[error("blindvote: transport error: {0}")]
    Transport(String),

    #[error("blindvote: malformed event: {0}")]
    Parse(String),

    #[error("blindvote: secure storage error: {0}")]
    Storage(String),

    #[error("blindvote: JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blindvote: no active voting session")]
    NoActiveSession,

    #[error("blindvote: operation not valid in step {0}")]
    InvalidStep(crate::VotingStep),

    #[error("blindvote: session failed and must be restarted: {0}")]
    SessionFailed(String),

    #[error("blindvote: voting session {0} is already in progress")]
    SessionActive(uuid::Uuid),

    #[error("blindvote: candidate {0} is not on the ballot")]
    InvalidCandidate(u32),

    #[error("blindvote: election {0} is not open for voting")]
    ElectionNotOpen(String),
}

impl Error {
    /// Can the failed step be re-invoked with the same session state?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Transport(_) | Error::Storage(_)
        )
    }

    /// Does this error require the session to be discarded?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Integrity
                | Error::InvalidKey(_)
                | Error::Unblind(_)
                | Error::SignatureVerification
                | Error::Configuration(_)
        )
    }
}
