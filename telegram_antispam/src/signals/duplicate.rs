use chrono::TimeDelta;

use super::{names, SignalExtractor};
use crate::{
    config::SignalConfig,
    error::SignalError,
    state::{Fingerprint, UserState},
    types::{MessageEvent, SpamSignal},
};

/// Score of a near-duplicate, compared to an exact one.
const NEAR_DUPLICATE_SCORE: f32 = 0.8;

/// Texts this long or longer are repeated on purpose, not by accident.
const CONFIDENT_LENGTH: f32 = 16.0;

/// The same thing sent again.
pub struct DuplicateContent {
    window: TimeDelta,
}

impl DuplicateContent {
    #[must_use]
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            window: config.duplicate_window(),
        }
    }

    /// 1.0 for something seen just now, fading to 0.5 at the edge of the window.
    fn freshness(&self, age: TimeDelta) -> Option<f32> {
        if age > self.window {
            return None;
        }
        let age = age.max(TimeDelta::zero()).num_milliseconds() as f32;
        let window = self.window.num_milliseconds().max(1) as f32;
        Some(1.0 - 0.5 * age / window)
    }
}

impl SignalExtractor for DuplicateContent {
    fn name(&self) -> &'static str {
        names::DUPLICATE
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        let Some(current) = Fingerprint::of(event) else {
            return Ok(SpamSignal::new(self.name(), 0.0, 1.0, "nothing to compare"));
        };

        let mut best = 0.0f32;
        let mut best_kind = "no repeats";
        for seen in &state.fingerprints {
            let Some(freshness) = self.freshness(event.timestamp - seen.seen_at) else {
                continue;
            };
            let (similarity, kind) = if seen.exact == current.exact {
                (1.0, "exact repeat")
            } else if seen.fuzzy.is_some() && seen.fuzzy == current.fuzzy {
                (NEAR_DUPLICATE_SCORE, "near repeat")
            } else {
                continue;
            };
            if similarity * freshness > best {
                best = similarity * freshness;
                best_kind = kind;
            }
        }

        // Saying "ok" twice is not much of a tell. Reposting the same file is.
        let confidence = if event.attachments().is_empty() {
            (current.length as f32 / CONFIDENT_LENGTH).clamp(0.25, 1.0)
        } else {
            1.0
        };

        Ok(SpamSignal::new(
            self.name(),
            best,
            confidence,
            format!(
                "{best_kind} among {} recent messages",
                state.fingerprints.len()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use teloxide::types::MessageId;

    use super::*;
    use crate::{
        config::Config,
        signals::tests::*,
        state::record_message,
        types::{Attachment, AttachmentKind, EventKind},
    };

    const SPAM: &str = "Join our VIP crypto signals group now!!!";

    #[test]
    fn second_copy_scores_higher_than_first() {
        let config = Config::default();
        let duplicate = DuplicateContent::new(&config.signals);
        let state = UserState::new(t(0));

        let first = duplicate.score(&msg(0, SPAM), &state);
        let state = record_message(&state, &msg(0, SPAM), &config);
        let second = duplicate.score(&msg(5, SPAM), &state);

        assert_eq!(first.score, 0.0);
        assert!(second.score > first.score);
        assert!(second.score > 0.99);
        assert_eq!(second.confidence, 1.0);
    }

    #[test]
    fn near_duplicates_and_age() {
        let config = Config::default();
        let duplicate = DuplicateContent::new(&config.signals);
        let state = record_message(&UserState::new(t(0)), &msg(0, SPAM), &config);

        let near = duplicate.score(&msg(1, "join our vip CRYPTO signals group NOW"), &state);
        assert!(near.score > 0.7 && near.score < 0.8);

        let later = duplicate.score(&msg(300, SPAM), &state);
        assert!(later.score < 0.9 && later.score > 0.5);

        let expired = duplicate.score(&msg(601, SPAM), &state);
        assert_eq!(expired.score, 0.0);

        let different = duplicate.score(&msg(1, "totally unrelated words"), &state);
        assert_eq!(different.score, 0.0);
    }

    #[test]
    fn reposted_files_count() {
        let config = Config::default();
        let duplicate = DuplicateContent::new(&config.signals);
        let media = |secs: i64| MessageEvent {
            chat_id: CHAT,
            user_id: USER,
            message_id: MessageId(secs as i32),
            timestamp: t(secs),
            kind: EventKind::Media {
                caption: None,
                links: Vec::new(),
                attachments: vec![Attachment {
                    kind: AttachmentKind::Photo,
                    unique_id: Some("AQADxyz".to_string()),
                }],
            },
        };
        let state = record_message(&UserState::new(t(0)), &media(0), &config);
        let signal = duplicate.score(&media(1), &state);
        assert!(signal.score > 0.99);
        assert_eq!(signal.confidence, 1.0);
    }
}
