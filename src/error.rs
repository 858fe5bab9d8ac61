//! Error taxonomy for the processing pipeline.

use thiserror::Error;

/// Failure classes flowing through the pipeline. The queue's retry loop
/// and the publish/AI fallback paths branch on the variant.
#[derive(Debug, Error)]
pub enum BotError {
    /// Relay read/write timeout, connection drop, AI timeout.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Relay policy rejection or a non-200 AI response.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Undecryptable envelope, unparseable receipt, empty content.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Queue full, rate limit exceeded, circuit open.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Pre-debit balance check failed.
    #[error("insufficient funds: have {balance} sats, need {required} sats")]
    InsufficientFunds { balance: u64, required: u64 },

    /// Store I/O failure or invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether the queue should retry the task after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Transient(_) | BotError::Internal(_))
    }

    /// Wrap a store-level failure.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        BotError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classes() {
        assert!(BotError::Transient("timeout".into()).is_retryable());
        assert!(BotError::Internal("io".into()).is_retryable());
        assert!(!BotError::Rejected("pow: required".into()).is_retryable());
        assert!(!BotError::Malformed("bad envelope".into()).is_retryable());
        assert!(!BotError::Overloaded("queue full".into()).is_retryable());
        assert!(!BotError::InsufficientFunds { balance: 0, required: 2 }.is_retryable());
    }
}
