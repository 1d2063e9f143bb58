//! Per (chat, user) moderation state.
//!
//! The store is a sharded map of per-key async mutexes, so unrelated users never contend on one
//! lock. Transforms of the state itself ([`record_message`] and [`record_action`]) are pure and
//! only ever applied by the pipeline once it knows the outcome of a decision.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use teloxide::types::{ChatId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    config::{Config, SignalConfig},
    error::StateError,
    misc::normalize_for_fingerprint,
    types::{Action, Decision, EventKind, MessageEvent},
};

pub type StateKey = (ChatId, UserId);

/// Exclusive access to one user's state. Held for the whole processing of one event.
pub type StateGuard = OwnedMutexGuard<UserState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustLevel {
    New,
    Normal,
    Trusted,
}

impl TrustLevel {
    /// Work out how much to trust a user based on what we know about them.
    ///
    /// Anyone with a violation on record is new again. Otherwise, having joined more than the
    /// maturity period ago or having sent enough clean messages makes one normal, and both
    /// together make one trusted.
    #[must_use]
    pub fn derive(state: &UserState, now: DateTime<Utc>, config: &Config) -> Self {
        if state.violation_count > 0 {
            return TrustLevel::New;
        }

        let matured = now - state.joined_at >= config.signals.account_maturity();
        let seasoned = state.clean_messages >= config.state.trusted_message_count;

        match (matured, seasoned) {
            (true, true) => TrustLevel::Trusted,
            (true, false) | (false, true) => TrustLevel::Normal,
            (false, false) => TrustLevel::New,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            TrustLevel::New => 0,
            TrustLevel::Normal => 1,
            TrustLevel::Trusted => 2,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrustLevel::New),
            1 => Some(TrustLevel::Normal),
            2 => Some(TrustLevel::Trusted),
            _ => None,
        }
    }
}

/// Hashes of one message's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Hash of the text exactly as sent, plus any attached files.
    pub exact: u32,
    /// Hash of the text with case, spacing, punctuation and numbers squashed out. Absent if
    /// nothing is left after that.
    pub fuzzy: Option<u32>,
    /// Length of the text, in characters.
    pub length: usize,
    pub seen_at: DateTime<Utc>,
}

impl Fingerprint {
    /// Fingerprint the content of this event, if it has any.
    #[must_use]
    pub fn of(event: &MessageEvent) -> Option<Self> {
        let text = event.text_full().unwrap_or_default();
        let attachments = event.attachments();
        if text.trim().is_empty() && attachments.is_empty() {
            return None;
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(text.as_bytes());
        for attachment in attachments {
            hasher.update(&[0]);
            if let Some(id) = &attachment.unique_id {
                hasher.update(id.as_bytes());
            }
        }
        let exact = hasher.finalize();

        let normalized = normalize_for_fingerprint(text);
        let fuzzy = (!normalized.is_empty()).then(|| crc32fast::hash(normalized.as_bytes()));

        Some(Self {
            exact,
            fuzzy,
            length: text.chars().count(),
            seen_at: event.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAction {
    pub action: Action,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    /// Timestamps of recent messages, oldest first. Bounded by the flood window and count.
    pub recent_messages: VecDeque<DateTime<Utc>>,
    /// Fingerprints of recent messages, oldest first. Bounded by the duplicate window and count.
    pub fingerprints: VecDeque<Fingerprint>,
    /// Punitive actions applied to this user. Only ever goes up, barring a manual reset.
    pub violation_count: u32,
    pub trust_level: TrustLevel,
    pub joined_at: DateTime<Utc>,
    /// False if `joined_at` is merely when we first saw this user.
    pub join_observed: bool,
    pub clean_messages: u32,
    pub last_action: Option<LastAction>,
    /// Set on join, cleared once the user has proven themselves with clean messages.
    pub heightened_scrutiny: bool,
    pub last_activity: DateTime<Utc>,
}

impl UserState {
    /// State of a user first seen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            recent_messages: VecDeque::new(),
            fingerprints: VecDeque::new(),
            violation_count: 0,
            trust_level: TrustLevel::New,
            joined_at: now,
            join_observed: false,
            clean_messages: 0,
            last_action: None,
            heightened_scrutiny: false,
            last_activity: now,
        }
    }

    /// Check the invariants that [`record_message`] and [`record_action`] uphold.
    ///
    /// # Errors
    /// Errors with a description of the broken invariant.
    pub fn validate(&self, config: &SignalConfig) -> Result<(), String> {
        if self.recent_messages.len() > config.max_timestamps {
            return Err(format!(
                "{} timestamps remembered, bound is {}",
                self.recent_messages.len(),
                config.max_timestamps
            ));
        }
        if self.fingerprints.len() > config.max_fingerprints {
            return Err(format!(
                "{} fingerprints remembered, bound is {}",
                self.fingerprints.len(),
                config.max_fingerprints
            ));
        }
        if !is_chronological(self.recent_messages.iter().copied()) {
            return Err("message timestamps are out of order".to_string());
        }
        if !is_chronological(self.fingerprints.iter().map(|f| f.seen_at)) {
            return Err("fingerprints are out of order".to_string());
        }
        if self.violation_count > 0 && self.trust_level != TrustLevel::New {
            return Err("user with violations is not marked as new".to_string());
        }
        Ok(())
    }

    /// True if this user is on the allow track: nothing bad on record.
    #[must_use]
    pub fn has_clean_record(&self) -> bool {
        self.violation_count == 0 && self.last_action.is_none()
    }
}

fn is_chronological(times: impl Iterator<Item = DateTime<Utc>>) -> bool {
    let mut last = None;
    for time in times {
        if last.is_some_and(|last| last > time) {
            return false;
        }
        last = Some(time);
    }
    true
}

/// Insert `item` into a deque sorted by `key`, after any items with the same key.
fn insert_sorted<T>(deque: &mut VecDeque<T>, item: T, key: impl Fn(&T) -> DateTime<Utc>) {
    let at = key(&item);
    let position = deque.partition_point(|x| key(x) <= at);
    deque.insert(position, item);
}

/// Remember this event in the user's state. Evicts anything that fell out of the windows.
#[must_use]
pub fn record_message(state: &UserState, event: &MessageEvent, config: &Config) -> UserState {
    let signals = &config.signals;
    let now = event.timestamp;
    let mut next = state.clone();

    match &event.kind {
        EventKind::Join { .. } => {
            next.joined_at = now;
            next.join_observed = true;
            next.heightened_scrutiny = true;
        }
        EventKind::Text { .. } | EventKind::Media { .. } => {
            insert_sorted(&mut next.recent_messages, now, |t| *t);
            if let Some(fingerprint) = Fingerprint::of(event) {
                insert_sorted(&mut next.fingerprints, fingerprint, |f| f.seen_at);
            }
        }
        EventKind::System => (),
    }

    let flood_horizon = now - signals.flood_window();
    while next
        .recent_messages
        .front()
        .is_some_and(|t| *t < flood_horizon)
        || next.recent_messages.len() > signals.max_timestamps
    {
        next.recent_messages.pop_front();
    }

    let duplicate_horizon = now - signals.duplicate_window();
    while next
        .fingerprints
        .front()
        .is_some_and(|f| f.seen_at < duplicate_horizon)
        || next.fingerprints.len() > signals.max_fingerprints
    {
        next.fingerprints.pop_front();
    }

    next.last_activity = next.last_activity.max(now);
    next.trust_level = TrustLevel::derive(&next, now, config);
    next
}

/// Apply the consequences of a decision that was carried out.
///
/// Punitive actions count as a violation; letting a user's message through counts as a clean
/// message. Warnings don't count either way.
#[must_use]
pub fn record_action(
    state: &UserState,
    event: &MessageEvent,
    decision: &Decision,
    config: &Config,
) -> UserState {
    let now = event.timestamp;
    let mut next = state.clone();

    match decision.action {
        Action::Allow => {
            if event.is_user_content() {
                next.clean_messages = next.clean_messages.saturating_add(1);
                if next.clean_messages >= config.state.trusted_message_count {
                    next.heightened_scrutiny = false;
                }
            }
        }
        action => {
            if action.is_punitive() {
                next.violation_count = next.violation_count.saturating_add(1);
            }
            next.last_action = Some(LastAction { action, at: now });
        }
    }

    next.last_activity = next.last_activity.max(now);
    next.trust_level = TrustLevel::derive(&next, now, config);
    next
}

/// Where all the per-user state lives.
pub struct StateStore {
    entries: DashMap<StateKey, Arc<Mutex<UserState>>>,
    config: Arc<Config>,
}

impl StateStore {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Lock the state of this user in this chat, creating it if it's not there yet.
    ///
    /// State that has been inactive for longer than the TTL is replaced with a fresh one, as is
    /// state that is found to be corrupted.
    pub async fn get_or_create(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StateGuard {
        // Cloning the Arc while the map's shard is locked is what keeps the sweep away.
        let slot = self
            .entries
            .entry((chat_id, user_id))
            .or_insert_with(|| Arc::new(Mutex::new(UserState::new(now))))
            .value()
            .clone();

        let mut state = slot.lock_owned().await;

        if now - state.last_activity > self.config.state.ttl() {
            log::debug!("Chat {chat_id}: user {user_id}: state expired, starting over");
            *state = UserState::new(now);
        } else if let Err(reason) = state.validate(&self.config.signals) {
            let error = StateError {
                chat_id,
                user_id,
                reason,
            };
            log::error!("{error}. Resetting it.");
            *state = UserState::new(now);
        }

        state
    }

    /// Drop entries that have been inactive for longer than the TTL.
    /// Entries that are in use or about to be are left alone.
    ///
    /// Returns the amount of entries dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.state.ttl();
        let before = self.entries.len();

        self.entries.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(state) => now - state.last_activity <= ttl,
                Err(_) => true,
            }
        });

        before.saturating_sub(self.entries.len())
    }

    /// Forget violations of this user, as requested by a human.
    ///
    /// Returns `false` if there's no such user on record.
    pub async fn reset_violations(&self, chat_id: ChatId, user_id: UserId) -> bool {
        let Some(slot) = self
            .entries
            .get(&(chat_id, user_id))
            .map(|x| x.value().clone())
        else {
            return false;
        };

        let mut state = slot.lock().await;
        state.violation_count = 0;
        state.last_action = None;
        let now = state.last_activity;
        state.trust_level = TrustLevel::derive(&state, now, &self.config);
        true
    }

    /// A copy of the committed state of this user, if there is any.
    pub async fn snapshot(&self, chat_id: ChatId, user_id: UserId) -> Option<UserState> {
        let slot = self
            .entries
            .get(&(chat_id, user_id))
            .map(|x| x.value().clone())?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    /// Copies of all committed states not currently being worked on, for saving.
    #[must_use]
    pub fn committed_states(&self) -> Vec<(StateKey, UserState)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let state = entry.value().try_lock().ok()?;
                Some((*entry.key(), state.clone()))
            })
            .collect()
    }

    /// Put previously saved states into the store, replacing whatever is there.
    pub fn restore(&self, states: impl IntoIterator<Item = (StateKey, UserState)>) {
        for (key, state) in states {
            self.entries.insert(key, Arc::new(Mutex::new(state)));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if this user has anything bad on record. Users we are not sure about, because
    /// their state is busy, count as having a clean record.
    #[must_use]
    pub fn has_clean_record(&self, chat_id: ChatId, user_id: UserId) -> bool {
        let Some(entry) = self.entries.get(&(chat_id, user_id)) else {
            return true;
        };
        entry
            .value()
            .try_lock()
            .map_or(true, |state| state.has_clean_record())
    }
}

/// Periodically drop expired entries from the store, for as long as it's around.
pub async fn sweep_spinloop(store: Weak<StateStore>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(store) = store.upgrade() else {
            return;
        };
        let swept = store.sweep(Utc::now());
        if swept > 0 {
            log::debug!("Swept {swept} expired user states.");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeDelta;
    use teloxide::types::MessageId;

    use super::*;

    const CHAT: ChatId = ChatId(-100);
    const USER: UserId = UserId(42);

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(secs: i64, text: &str) -> MessageEvent {
        MessageEvent::text(CHAT, USER, MessageId(secs as i32), t(secs), text)
    }

    fn decision(action: Action) -> Decision {
        Decision {
            action,
            reason: String::new(),
            escalation_level: 0,
            heightened_scrutiny: false,
        }
    }

    #[test]
    fn timestamp_window_stays_bounded() {
        let config = Config::default();
        let mut state = UserState::new(t(0));
        for i in 0..100 {
            state = record_message(&state, &msg(i, "hi"), &config);
            assert!(state.recent_messages.len() <= config.signals.max_timestamps);
            assert!(state
                .recent_messages
                .iter()
                .all(|x| *x >= t(i) - config.signals.flood_window()));
        }
        // Flood window is 10 seconds, one message per second.
        assert_eq!(state.recent_messages.len(), 11);
        assert!(state.fingerprints.len() <= config.signals.max_fingerprints);
        assert!(state.validate(&config.signals).is_ok());

        // Count bound holds even inside the window.
        let mut state = UserState::new(t(0));
        for i in 0..100 {
            state = record_message(&state, &msg(0, &format!("burst {i}")), &config);
        }
        assert_eq!(state.recent_messages.len(), config.signals.max_timestamps);
    }

    #[test]
    fn record_message_is_pure() {
        let config = Config::default();
        let state = UserState::new(t(0));
        let before = state.clone();
        let after = record_message(&state, &msg(1, "hello"), &config);
        assert_eq!(state, before);
        assert_eq!(after.recent_messages.len(), 1);
        assert_eq!(after.fingerprints.len(), 1);
        assert_eq!(after.violation_count, 0);
    }

    #[test]
    fn joins_are_remembered() {
        let config = Config::default();
        let join = MessageEvent::join(CHAT, USER, MessageId(1), t(5), None, "Some One");
        let state = record_message(&UserState::new(t(0)), &join, &config);
        assert_eq!(state.joined_at, t(5));
        assert!(state.join_observed);
        assert!(state.heightened_scrutiny);
        assert!(state.recent_messages.is_empty());
    }

    #[test]
    fn only_punitive_actions_are_violations() {
        let config = Config::default();
        let state = UserState::new(t(0));
        let event = msg(1, "hi");

        let allowed = record_action(&state, &event, &decision(Action::Allow), &config);
        assert_eq!(allowed.violation_count, 0);
        assert_eq!(allowed.clean_messages, 1);
        assert_eq!(allowed.last_action, None);

        let warned = record_action(&state, &event, &decision(Action::Warn), &config);
        assert_eq!(warned.violation_count, 0);
        assert_eq!(warned.last_action.unwrap().action, Action::Warn);

        let deleted = record_action(&state, &event, &decision(Action::DeleteAndWarn), &config);
        assert_eq!(deleted.violation_count, 1);
        assert_eq!(deleted.trust_level, TrustLevel::New);

        let banned = record_action(&deleted, &event, &decision(Action::Ban), &config);
        assert_eq!(banned.violation_count, 2);
    }

    #[test]
    fn trust_grows_with_time_and_behavior() {
        let config = Config::default();
        let day = config.signals.account_maturity_secs as i64;
        let mut state = UserState::new(t(0));
        assert_eq!(TrustLevel::derive(&state, t(10), &config), TrustLevel::New);
        assert_eq!(TrustLevel::derive(&state, t(day), &config), TrustLevel::Normal);

        for i in 0..3 {
            state = record_action(&state, &msg(i, "hi"), &decision(Action::Allow), &config);
        }
        assert_eq!(state.trust_level, TrustLevel::Normal);
        assert_eq!(TrustLevel::derive(&state, t(day), &config), TrustLevel::Trusted);
    }

    #[test]
    fn corrupted_state_is_detected() {
        let config = Config::default();
        let mut state = UserState::new(t(0));
        state.recent_messages.push_back(t(5));
        state.recent_messages.push_back(t(1));
        assert!(state.validate(&config.signals).is_err());

        let mut state = UserState::new(t(0));
        state.violation_count = 3;
        state.trust_level = TrustLevel::Trusted;
        assert!(state.validate(&config.signals).is_err());
    }

    #[tokio::test]
    async fn get_or_create_creates_and_expires() {
        let config = Arc::new(Config::default());
        let store = StateStore::new(config.clone());
        assert!(store.snapshot(CHAT, USER).await.is_none());

        {
            let mut state = store.get_or_create(CHAT, USER, t(0)).await;
            *state = record_action(&state, &msg(0, "x"), &decision(Action::Delete), &config);
        }
        assert_eq!(store.snapshot(CHAT, USER).await.unwrap().violation_count, 1);

        // Still within TTL.
        let state = store.get_or_create(CHAT, USER, t(60)).await;
        assert_eq!(state.violation_count, 1);
        drop(state);

        // Way past TTL.
        let later = t(0) + config.state.ttl() + TimeDelta::seconds(1);
        let state = store.get_or_create(CHAT, USER, later).await;
        assert_eq!(state.violation_count, 0);
    }

    #[tokio::test]
    async fn corrupted_entries_are_reset_on_lookup() {
        let config = Arc::new(Config::default());
        let store = StateStore::new(config.clone());
        let mut broken = UserState::new(t(0));
        broken.violation_count = 1;
        broken.trust_level = TrustLevel::Trusted;
        store.restore([((CHAT, USER), broken)]);

        let state = store.get_or_create(CHAT, USER, t(1)).await;
        assert_eq!(*state, UserState::new(t(1)));
    }

    #[tokio::test]
    async fn sweep_spares_busy_entries() {
        let config = Arc::new(Config::default());
        let store = StateStore::new(config.clone());
        let later = t(0) + config.state.ttl() + TimeDelta::seconds(1);

        drop(store.get_or_create(CHAT, UserId(1), t(0)).await);
        let busy = store.get_or_create(CHAT, UserId(2), t(0)).await;
        drop(store.get_or_create(CHAT, UserId(3), later).await);

        assert_eq!(store.sweep(later), 1);
        assert_eq!(store.len(), 2);
        drop(busy);
        assert_eq!(store.sweep(later), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let config = Arc::new(Config::default());
        let store = Arc::new(StateStore::new(config.clone()));

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let mut state = store.get_or_create(CHAT, USER, t(0)).await;
                let snapshot = state.clone();
                // Yield while holding the lock, to give others a chance to barge in.
                tokio::task::yield_now().await;
                let event = msg(i, "x");
                *state = record_action(&snapshot, &event, &decision(Action::Delete), &config);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.snapshot(CHAT, USER).await.unwrap().violation_count, 50);
    }

    #[tokio::test]
    async fn violations_can_be_forgiven() {
        let config = Arc::new(Config::default());
        let store = StateStore::new(config.clone());
        assert!(!store.reset_violations(CHAT, USER).await);

        {
            let mut state = store.get_or_create(CHAT, USER, t(0)).await;
            *state = record_action(&state, &msg(0, "x"), &decision(Action::Ban), &config);
        }
        assert!(!store.has_clean_record(CHAT, USER));
        assert!(store.reset_violations(CHAT, USER).await);
        assert!(store.has_clean_record(CHAT, USER));
        assert_eq!(store.snapshot(CHAT, USER).await.unwrap().violation_count, 0);
    }
}
