use std::{fmt::Display, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use teloxide::types::{ChatId, MessageId, UserId};

use crate::misc::find_links_in_text;

/// Kind of a file attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Photo,
    Video,
    Animation,
    Document,
    Sticker,
    Audio,
    Voice,
    Other,
}

/// Metadata of one file attached to a message. The file itself is never looked at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Telegram's ID of the file that is the same across bots and time.
    pub unique_id: Option<String>,
}

/// What an inbound event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A plain text message.
    Text { text: String, links: Vec<String> },
    /// A message with files in it, possibly with a caption.
    Media {
        caption: Option<String>,
        links: Vec<String>,
        attachments: Vec<Attachment>,
    },
    /// A user has joined the chat.
    Join {
        username: Option<String>,
        full_name: String,
    },
    /// Anything else Telegram may put into a chat, like pins or topic changes.
    System,
}

/// One inbound event to be moderated. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl MessageEvent {
    /// Convenience constructor for a text message, finding links in the text by itself.
    #[must_use]
    pub fn text(
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        let links = find_links_in_text(&text);
        Self {
            chat_id,
            user_id,
            message_id,
            timestamp,
            kind: EventKind::Text { text, links },
        }
    }

    /// Convenience constructor for a join event.
    #[must_use]
    pub fn join(
        chat_id: ChatId,
        user_id: UserId,
        message_id: MessageId,
        timestamp: DateTime<Utc>,
        username: Option<String>,
        full_name: impl Into<String>,
    ) -> Self {
        Self {
            chat_id,
            user_id,
            message_id,
            timestamp,
            kind: EventKind::Join {
                username,
                full_name: full_name.into(),
            },
        }
    }

    /// Text or caption of this message, if any.
    #[must_use]
    pub fn text_full(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Text { text, .. } => Some(text),
            EventKind::Media { caption, .. } => caption.as_deref(),
            EventKind::Join { .. } | EventKind::System => None,
        }
    }

    /// Links and mentions in this message.
    #[must_use]
    pub fn links(&self) -> &[String] {
        match &self.kind {
            EventKind::Text { links, .. } | EventKind::Media { links, .. } => links,
            EventKind::Join { .. } | EventKind::System => &[],
        }
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        match &self.kind {
            EventKind::Media { attachments, .. } => attachments,
            _ => &[],
        }
    }

    #[must_use]
    pub fn is_join(&self) -> bool {
        matches!(self.kind, EventKind::Join { .. })
    }

    /// True if this is something a user actually said, as opposed to a join or a service message.
    #[must_use]
    pub fn is_user_content(&self) -> bool {
        matches!(self.kind, EventKind::Text { .. } | EventKind::Media { .. })
    }
}

/// One independent piece of evidence about a message being spam.
#[derive(Debug, Clone, PartialEq)]
pub struct SpamSignal {
    pub name: &'static str,
    /// How spammy this looks, from 0 to 1.
    pub score: f32,
    /// How sure the extractor is of the score, from 0 to 1.
    pub confidence: f32,
    pub rationale: String,
}

impl SpamSignal {
    /// Makes a new signal, clamping `score` and `confidence` into `0..=1`.
    /// NaNs become zeroes.
    #[must_use]
    pub fn new(
        name: &'static str,
        score: f32,
        confidence: f32,
        rationale: impl Into<String>,
    ) -> Self {
        fn unit(x: f32) -> f32 {
            if x.is_nan() {
                0.0
            } else {
                x.clamp(0.0, 1.0)
            }
        }
        Self {
            name,
            score: unit(score),
            confidence: unit(confidence),
            rationale: rationale.into(),
        }
    }

    /// A signal that says nothing, for when an extractor failed.
    #[must_use]
    pub fn zero_confidence(name: &'static str, rationale: impl Into<String>) -> Self {
        Self::new(name, 0.0, 0.0, rationale)
    }

    /// Score weighted by confidence.
    #[must_use]
    pub fn effective_score(&self) -> f32 {
        self.score * self.confidence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Classification {
    Clean,
    Suspicious,
    Spam,
}

impl Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Classification::Clean => "clean",
            Classification::Suspicious => "suspicious",
            Classification::Spam => "spam",
        })
    }
}

/// Aggregate spam-likelihood classification of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub aggregate_score: f32,
    /// Signals that contributed anything, sorted by name.
    pub triggered_signals: Vec<SpamSignal>,
    pub classification: Classification,
}

impl Verdict {
    #[must_use]
    pub fn triggered(&self, name: &str) -> bool {
        self.triggered_signals.iter().any(|s| s.name == name)
    }
}

/// What to do about a message and its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Warn,
    Delete,
    DeleteAndWarn,
    Mute(Duration),
    Kick,
    Ban,
}

impl Action {
    /// Position of this action on the punishment ladder. Higher is harsher.
    #[must_use]
    pub fn severity(&self) -> u8 {
        match self {
            Action::Allow => 0,
            Action::Warn => 1,
            Action::Delete => 2,
            Action::DeleteAndWarn => 3,
            Action::Mute(_) => 4,
            Action::Kick => 5,
            Action::Ban => 6,
        }
    }

    /// Punitive actions are the ones that count as a violation once applied.
    #[must_use]
    pub fn is_punitive(&self) -> bool {
        !matches!(self, Action::Allow | Action::Warn)
    }

    /// True if this action removes the offending message.
    #[must_use]
    pub fn deletes_message(&self) -> bool {
        self.is_punitive()
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Allow => f.write_str("allow"),
            Action::Warn => f.write_str("warn"),
            Action::Delete => f.write_str("delete"),
            Action::DeleteAndWarn => f.write_str("delete+warn"),
            Action::Mute(duration) => write!(f, "mute:{}", duration.as_secs()),
            Action::Kick => f.write_str("kick"),
            Action::Ban => f.write_str("ban"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "allow" => Action::Allow,
            "warn" => Action::Warn,
            "delete" => Action::Delete,
            "delete+warn" => Action::DeleteAndWarn,
            "kick" => Action::Kick,
            "ban" => Action::Ban,
            _ => {
                let secs = s
                    .strip_prefix("mute:")
                    .ok_or_else(|| format!("Unknown action: {s}"))?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("Invalid mute duration: {secs}"))?;
                Action::Mute(Duration::from_secs(secs))
            }
        })
    }
}

/// Outcome of the decision policy for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    /// Rung of the escalation ladder the sender was on: 0 below K1, 1 below K2, 2 at the top.
    pub escalation_level: u8,
    /// Set for joins that got allowed in but should be watched closely.
    pub heightened_scrutiny: bool,
}

impl Decision {
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Allow,
            reason: reason.into(),
            escalation_level: 0,
            heightened_scrutiny: false,
        }
    }
}
