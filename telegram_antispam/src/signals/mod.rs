//! Signal extractors. Each one looks at one inbound event and the sender's state as it was
//! before the event, and produces one independent [`SpamSignal`].
//!
//! Extractors must not fail: if one can't make sense of an event, it produces a signal with
//! zero confidence, which the aggregator then ignores.

use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::watch;

use crate::{
    config::Config,
    error::SignalError,
    state::UserState,
    types::{MessageEvent, SpamSignal},
};

// Extractors
mod duplicate;
mod flood;
mod links;
mod new_account;
mod words;

pub use duplicate::DuplicateContent;
pub use flood::Flood;
pub use links::LinkDensity;
pub use new_account::NewAccount;
pub use words::{JoinSpam, ProhibitedWords};

/// Names of the signals, as used in configuration of their weights.
pub mod names {
    pub const FLOOD: &str = "flood";
    pub const DUPLICATE: &str = "duplicate";
    pub const NEW_ACCOUNT: &str = "new_account";
    pub const LINKS: &str = "links";
    pub const PROHIBITED_WORDS: &str = "prohibited_words";
    pub const JOIN_SPAM: &str = "join_spam";
}

/// Lowercase words that get a message flagged, shared with whoever edits them.
pub type WordList = watch::Receiver<Arc<BTreeSet<String>>>;

pub trait SignalExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score this event.
    ///
    /// # Errors
    /// Errors if the event makes no sense to this extractor.
    fn try_score(&self, event: &MessageEvent, state: &UserState)
        -> Result<SpamSignal, SignalError>;

    /// Score this event, degrading to a zero-confidence signal on error.
    fn score(&self, event: &MessageEvent, state: &UserState) -> SpamSignal {
        match self.try_score(event, state) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!(
                    "Chat {}: user {}: {} extractor gave up: {e}",
                    event.chat_id,
                    event.user_id,
                    self.name()
                );
                SpamSignal::zero_confidence(self.name(), e.to_string())
            }
        }
    }
}

/// The full set of extractors the bot runs.
#[must_use]
pub fn default_extractors(config: &Config, words: WordList) -> Vec<Box<dyn SignalExtractor>> {
    let signals = &config.signals;
    vec![
        Box::new(Flood::new(signals)),
        Box::new(DuplicateContent::new(signals)),
        Box::new(NewAccount::new(signals)),
        Box::new(LinkDensity::new(signals)),
        Box::new(ProhibitedWords::new(words)),
        Box::new(JoinSpam::new(signals)),
    ]
}

/// Run every extractor over this event. The order of the result means nothing.
#[must_use]
pub fn extract_all(
    extractors: &[Box<dyn SignalExtractor>],
    event: &MessageEvent,
    state: &UserState,
) -> Vec<SpamSignal> {
    extractors
        .iter()
        .map(|extractor| extractor.score(event, state))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::{DateTime, Utc};
    use teloxide::types::{ChatId, MessageId, UserId};

    use super::*;

    pub const CHAT: ChatId = ChatId(-1001);
    pub const USER: UserId = UserId(7);

    pub fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn msg(secs: i64, text: &str) -> MessageEvent {
        MessageEvent::text(CHAT, USER, MessageId(secs as i32), t(secs), text)
    }

    pub fn word_list(words: &[&str]) -> WordList {
        let set = words.iter().map(|w| w.to_string()).collect();
        let (tx, rx) = watch::channel(Arc::new(set));
        // Keep the value around after the sender is gone.
        drop(tx);
        rx
    }

    struct Grumpy;

    impl SignalExtractor for Grumpy {
        fn name(&self) -> &'static str {
            "grumpy"
        }
        fn try_score(&self, _: &MessageEvent, _: &UserState) -> Result<SpamSignal, SignalError> {
            Err(SignalError::Malformed("no".to_string()))
        }
    }

    #[test]
    fn failing_extractor_degrades_to_zero_confidence() {
        let signal = Grumpy.score(&msg(0, "hi"), &UserState::new(t(0)));
        assert_eq!(signal.name, "grumpy");
        assert_eq!(signal.confidence, 0.0);
        assert_eq!(signal.effective_score(), 0.0);
    }

    #[test]
    fn every_extractor_runs() {
        let config = Config::default();
        let extractors = default_extractors(&config, word_list(&[]));
        let signals = extract_all(&extractors, &msg(0, "hi"), &UserState::new(t(0)));
        let mut names: Vec<_> = signals.iter().map(|s| s.name).collect();
        names.sort_unstable();
        let mut expected: Vec<_> = config.weights.iter().map(|(n, _)| n).collect();
        expected.sort_unstable();
        assert_eq!(names, expected);
    }
}
