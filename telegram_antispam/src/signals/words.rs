use super::{names, SignalExtractor, WordList};
use crate::{
    config::SignalConfig,
    error::SignalError,
    state::UserState,
    types::{EventKind, MessageEvent, SpamSignal},
};

/// Text to look for bad words in: the message itself, or the name of whoever joined.
fn searchable_text(event: &MessageEvent) -> Option<String> {
    match &event.kind {
        EventKind::Text { .. } | EventKind::Media { .. } => event.text_full().map(str::to_lowercase),
        EventKind::Join {
            username,
            full_name,
        } => {
            let mut text = full_name.to_lowercase();
            if let Some(username) = username {
                text.push(' ');
                text.push_str(&username.to_lowercase());
            }
            Some(text)
        }
        EventKind::System => None,
    }
}

/// Words the owner of the bot does not want to see.
pub struct ProhibitedWords {
    words: WordList,
}

impl ProhibitedWords {
    #[must_use]
    pub fn new(words: WordList) -> Self {
        Self { words }
    }
}

impl SignalExtractor for ProhibitedWords {
    fn name(&self) -> &'static str {
        names::PROHIBITED_WORDS
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        _state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        let Some(text) = searchable_text(event) else {
            return Ok(SpamSignal::new(self.name(), 0.0, 1.0, "no text"));
        };

        let words = self.words.borrow().clone();
        match words.iter().find(|word| text.contains(word.as_str())) {
            Some(word) => Ok(SpamSignal::new(
                self.name(),
                1.0,
                1.0,
                format!("contains a prohibited word ({word:?})"),
            )),
            None => Ok(SpamSignal::new(self.name(), 0.0, 1.0, "no prohibited words")),
        }
    }
}

/// Joins of users whose names give them away.
pub struct JoinSpam {
    patterns: Vec<String>,
}

impl JoinSpam {
    #[must_use]
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            patterns: config
                .bad_name_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }
}

impl SignalExtractor for JoinSpam {
    fn name(&self) -> &'static str {
        names::JOIN_SPAM
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        _state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        if !event.is_join() {
            return Ok(SpamSignal::new(self.name(), 0.0, 1.0, "not a join"));
        }
        let Some(name) = searchable_text(event) else {
            return Err(SignalError::Malformed("join without a name".to_string()));
        };

        match self.patterns.iter().find(|p| name.contains(p.as_str())) {
            Some(pattern) => Ok(SpamSignal::new(
                self.name(),
                1.0,
                1.0,
                format!("name matches {pattern:?}"),
            )),
            None => Ok(SpamSignal::new(self.name(), 0.0, 1.0, "unremarkable name")),
        }
    }
}

#[cfg(test)]
mod tests {
    use teloxide::types::MessageId;

    use super::*;
    use crate::{config::Config, signals::tests::*};

    #[test]
    fn prohibited_words_anywhere() {
        let words = ProhibitedWords::new(word_list(&["casino", "dm me"]));
        let state = UserState::new(t(0));

        let hit = words.score(&msg(0, "Best CASINO bonuses, DM me"), &state);
        assert_eq!(hit.score, 1.0);
        assert_eq!(words.score(&msg(0, "what a nice day"), &state).score, 0.0);

        let join = MessageEvent::join(CHAT, USER, MessageId(1), t(0), None, "Casino Queen");
        assert_eq!(words.score(&join, &state).score, 1.0);
    }

    #[test]
    fn word_list_changes_are_seen() {
        let (tx, rx) = tokio::sync::watch::channel(std::sync::Arc::default());
        let words = ProhibitedWords::new(rx);
        let state = UserState::new(t(0));
        assert_eq!(words.score(&msg(0, "buy followers"), &state).score, 0.0);

        tx.send_replace(std::sync::Arc::new(["followers".to_string()].into()));
        assert_eq!(words.score(&msg(0, "buy followers"), &state).score, 1.0);
    }

    #[test]
    fn bad_names_on_join_only() {
        let config = Config::default();
        let join_spam = JoinSpam::new(&config.signals);
        let state = UserState::new(t(0));

        let bad = MessageEvent::join(
            CHAT,
            USER,
            MessageId(1),
            t(0),
            Some("AirDrop_Official".to_string()),
            "Free Tokens",
        );
        assert_eq!(join_spam.score(&bad, &state).score, 1.0);

        let fine = MessageEvent::join(CHAT, USER, MessageId(1), t(0), None, "Jane Doe");
        assert_eq!(join_spam.score(&fine, &state).score, 0.0);

        assert_eq!(join_spam.score(&msg(0, "airdrop"), &state).score, 0.0);
    }
}
