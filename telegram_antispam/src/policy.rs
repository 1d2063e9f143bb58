//! Turning verdicts into actions, escalating for repeat offenders.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    config::{PolicyConfig, TerminalAction},
    signals::names,
    state::UserState,
    types::{Action, Classification, Decision, MessageEvent, Verdict},
};

pub struct DecisionPolicy {
    config: PolicyConfig,
}

impl DecisionPolicy {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Rung of the escalation ladder for this many violations.
    #[must_use]
    pub fn escalation_level(&self, violation_count: u32) -> u8 {
        if violation_count < self.config.mute_after {
            0
        } else if violation_count < self.config.terminal_after {
            1
        } else {
            2
        }
    }

    /// How long to mute someone with this many violations for.
    #[must_use]
    pub fn mute_duration(&self, violation_count: u32) -> Duration {
        let doublings = violation_count.saturating_sub(self.config.mute_after).min(32);
        let secs = self
            .config
            .base_mute_secs
            .saturating_mul(1u64 << doublings)
            .min(self.config.max_mute_secs);
        Duration::from_secs(secs)
    }

    fn terminal_action(&self) -> Action {
        match self.config.terminal_action {
            TerminalAction::Kick => Action::Kick,
            TerminalAction::Ban => Action::Ban,
        }
    }

    /// Decide what to do about this event.
    ///
    /// `state` must be the sender's state from before this event, which the verdict was made
    /// from as well.
    #[must_use]
    pub fn decide(
        &self,
        event: &MessageEvent,
        verdict: &Verdict,
        state: &UserState,
        now: DateTime<Utc>,
    ) -> Decision {
        let vc = state.violation_count;
        let escalation_level = self.escalation_level(vc);

        if event.is_join() {
            let name_flagged =
                verdict.triggered(names::JOIN_SPAM) || verdict.triggered(names::PROHIBITED_WORDS);
            let has_history = vc > 0;
            if verdict.classification == Classification::Clean || !(name_flagged || has_history) {
                return Decision {
                    action: Action::Allow,
                    reason: format!("joined, score {:.2}", verdict.aggregate_score),
                    escalation_level,
                    heightened_scrutiny: true,
                };
            }
        }

        let (mut action, mut reason) = match verdict.classification {
            Classification::Clean => (Action::Allow, "clean".to_string()),
            Classification::Suspicious if vc == 0 => (Action::Warn, "suspicious".to_string()),
            Classification::Suspicious => (
                Action::Delete,
                format!("suspicious, {vc} violations on record"),
            ),
            Classification::Spam => match escalation_level {
                0 => (Action::DeleteAndWarn, "spam".to_string()),
                1 => (
                    Action::Mute(self.mute_duration(vc)),
                    format!("spam, {vc} violations on record"),
                ),
                _ => (
                    self.terminal_action(),
                    format!("spam, {vc} violations on record"),
                ),
            },
        };

        if verdict.classification != Classification::Clean {
            if let Some(floor) = self.cooldown_floor(state, now) {
                if floor.severity() > action.severity() {
                    action = floor;
                    reason.push_str(&format!(", kept at {floor} within cool-down"));
                }
                if let (Action::Mute(current), Action::Mute(kept)) = (action, floor) {
                    if kept > current {
                        action = floor;
                        reason.push_str(&format!(", kept at {floor} within cool-down"));
                    }
                }
            }
        }

        let signals = verdict
            .triggered_signals
            .iter()
            .map(|s| s.name)
            .collect::<Vec<_>>()
            .join(", ");
        if !signals.is_empty() {
            reason.push_str(&format!(" ({signals})"));
        }

        Decision {
            action,
            reason: format!("score {:.2}, {reason}", verdict.aggregate_score),
            escalation_level,
            heightened_scrutiny: state.heightened_scrutiny,
        }
    }

    /// The last action taken against this user, if it is recent enough that nothing milder
    /// should follow it.
    fn cooldown_floor(&self, state: &UserState, now: DateTime<Utc>) -> Option<Action> {
        let last = state.last_action?;
        let since = now - last.at;
        (since >= chrono::TimeDelta::zero() && since < self.config.cooldown()).then_some(last.action)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use teloxide::types::{ChatId, MessageId, UserId};

    use super::*;
    use crate::{
        config::Config,
        state::{record_action, LastAction, TrustLevel},
        types::SpamSignal,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(secs: i64) -> MessageEvent {
        MessageEvent::text(ChatId(-5), UserId(5), MessageId(1), t(secs), "whatever")
    }

    fn verdict(classification: Classification, signals: &[&'static str]) -> Verdict {
        Verdict {
            aggregate_score: match classification {
                Classification::Clean => 0.1,
                Classification::Suspicious => 0.5,
                Classification::Spam => 0.9,
            },
            triggered_signals: signals
                .iter()
                .map(|name| SpamSignal::new(*name, 1.0, 1.0, ""))
                .collect(),
            classification,
        }
    }

    fn with_violations(vc: u32) -> UserState {
        let mut state = UserState::new(t(0));
        state.violation_count = vc;
        state.trust_level = TrustLevel::New;
        state
    }

    #[test]
    fn ladder() {
        let policy = DecisionPolicy::new(PolicyConfig::default());
        let spam = verdict(Classification::Spam, &["links"]);
        let suspicious = verdict(Classification::Suspicious, &["links"]);
        let clean = verdict(Classification::Clean, &[]);
        let decide = |v: &Verdict, vc| policy.decide(&msg(10), v, &with_violations(vc), t(10));

        assert_eq!(decide(&clean, 0).action, Action::Allow);
        assert_eq!(decide(&clean, 10).action, Action::Allow);
        assert_eq!(decide(&suspicious, 0).action, Action::Warn);
        assert_eq!(decide(&suspicious, 1).action, Action::Delete);
        assert_eq!(decide(&spam, 0).action, Action::DeleteAndWarn);
        assert_eq!(decide(&spam, 1).action, Action::DeleteAndWarn);
        assert_eq!(
            decide(&spam, 2).action,
            Action::Mute(Duration::from_secs(600))
        );
        assert_eq!(
            decide(&spam, 3).action,
            Action::Mute(Duration::from_secs(1200))
        );
        assert_eq!(decide(&spam, 4).action, Action::Ban);
        assert_eq!(decide(&spam, 4).escalation_level, 2);
        assert_eq!(decide(&spam, 100).action, Action::Ban);
    }

    #[test]
    fn terminal_action_is_configurable() {
        let policy = DecisionPolicy::new(PolicyConfig {
            terminal_action: TerminalAction::Kick,
            ..PolicyConfig::default()
        });
        let spam = verdict(Classification::Spam, &[]);
        let decision = policy.decide(&msg(0), &spam, &with_violations(7), t(0));
        assert_eq!(decision.action, Action::Kick);
    }

    #[test]
    fn mutes_are_capped() {
        let policy = DecisionPolicy::new(PolicyConfig::default());
        assert_eq!(policy.mute_duration(2), Duration::from_secs(600));
        assert_eq!(policy.mute_duration(6), Duration::from_secs(9600));
        assert_eq!(policy.mute_duration(40), Duration::from_secs(86400));
        assert_eq!(policy.mute_duration(u32::MAX), Duration::from_secs(86400));
    }

    #[test]
    fn escalation_is_monotonic_over_a_spam_run() {
        let config = Config::default();
        let policy = DecisionPolicy::new(config.policy.clone());
        let spam = verdict(Classification::Spam, &["duplicate"]);
        let mut state = UserState::new(t(0));
        let mut last_severity = 0;

        for i in 0..8 {
            let event = msg(i * 60);
            let decision = policy.decide(&event, &spam, &state, event.timestamp);
            assert!(decision.action.severity() >= last_severity);
            last_severity = decision.action.severity();
            state = record_action(&state, &event, &decision, &config);
        }
        assert_eq!(state.violation_count, 8);
        assert_eq!(state.last_action.unwrap().action, Action::Ban);
    }

    #[test]
    fn cooldown_keeps_actions_from_getting_milder() {
        let policy = DecisionPolicy::new(PolicyConfig::default());
        let mut state = with_violations(1);
        state.last_action = Some(LastAction {
            action: Action::Mute(Duration::from_secs(600)),
            at: t(0),
        });
        let suspicious = verdict(Classification::Suspicious, &[]);

        let decision = policy.decide(&msg(60), &suspicious, &state, t(60));
        assert_eq!(decision.action, Action::Mute(Duration::from_secs(600)));

        // Clean messages are never punished.
        let clean = verdict(Classification::Clean, &[]);
        assert_eq!(
            policy.decide(&msg(60), &clean, &state, t(60)).action,
            Action::Allow
        );

        // After the cool-down, back to the ladder.
        let decision = policy.decide(&msg(7200), &suspicious, &state, t(7200));
        assert_eq!(decision.action, Action::Delete);
    }

    #[test]
    fn cooldown_keeps_longer_mutes() {
        let policy = DecisionPolicy::new(PolicyConfig::default());
        let mut state = with_violations(2);
        state.last_action = Some(LastAction {
            action: Action::Mute(Duration::from_secs(3600)),
            at: t(0),
        });
        let spam = verdict(Classification::Spam, &["links"]);

        let decision = policy.decide(&msg(60), &spam, &state, t(60));
        assert_eq!(decision.escalation_level, 1);
        assert_eq!(decision.action, Action::Mute(Duration::from_secs(3600)));
        assert!(decision.reason.contains("within cool-down"));

        // A shorter mute on record doesn't shorten the next one.
        state.last_action = Some(LastAction {
            action: Action::Mute(Duration::from_secs(60)),
            at: t(0),
        });
        let decision = policy.decide(&msg(60), &spam, &state, t(60));
        assert_eq!(decision.action, Action::Mute(Duration::from_secs(600)));
    }

    #[test]
    fn joins_get_in_unless_their_name_is_bad() {
        let policy = DecisionPolicy::new(PolicyConfig::default());
        let join = MessageEvent::join(ChatId(-5), UserId(5), MessageId(1), t(0), None, "Jo");
        let state = UserState::new(t(0));

        let decide = |v: Verdict| policy.decide(&join, &v, &state, t(0));

        let fine = decide(verdict(Classification::Clean, &["new_account"]));
        assert_eq!(fine.action, Action::Allow);
        assert!(fine.heightened_scrutiny);

        let odd = decide(verdict(Classification::Suspicious, &["new_account"]));
        assert_eq!(odd.action, Action::Allow);
        assert!(odd.heightened_scrutiny);

        let bad = decide(verdict(Classification::Spam, &["join_spam"]));
        assert_eq!(bad.action, Action::DeleteAndWarn);

        let worse = policy.decide(
            &join,
            &verdict(Classification::Spam, &["prohibited_words"]),
            &with_violations(5),
            t(0),
        );
        assert_eq!(worse.action, Action::Ban);
    }
}
