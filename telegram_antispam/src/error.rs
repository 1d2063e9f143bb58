use std::time::Duration;

use teloxide::types::{ChatId, UserId};
use thiserror::Error;

/// A failure reported by the chat platform when trying to apply a moderation action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth trying again later: rate limits, network trouble, timeouts.
    #[error("transient delivery failure: {reason}")]
    Transient {
        reason: String,
        /// How long the platform asked us to wait, if it did.
        retry_after: Option<Duration>,
    },
    /// Will fail the same way no matter how often it's retried:
    /// missing permissions, unknown user or chat, and such.
    #[error("permanent delivery failure: {reason}")]
    Permanent { reason: String },
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A signal extractor could not make sense of an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Per-user state broke one of its invariants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("corrupted state for chat {chat_id}, user {user_id}: {reason}")]
pub struct StateError {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reasons an event did not make it through the moderation pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("the pipeline is shutting down")]
    ShuttingDown,
    #[error("an event was dropped from the full queue of chat {0}")]
    QueueOverflow(ChatId),
}
