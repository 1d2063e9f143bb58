use chrono::TimeDelta;

use super::{names, SignalExtractor};
use crate::{
    config::SignalConfig,
    error::SignalError,
    state::UserState,
    types::{MessageEvent, SpamSignal},
};

/// Too many messages in too little time.
pub struct Flood {
    window: TimeDelta,
    max_messages: u32,
}

impl Flood {
    #[must_use]
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            window: config.flood_window(),
            max_messages: config.flood_max_messages,
        }
    }
}

impl SignalExtractor for Flood {
    fn name(&self) -> &'static str {
        names::FLOOD
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        if !event.is_user_content() {
            return Ok(SpamSignal::new(self.name(), 0.0, 1.0, "not a message"));
        }

        let now = event.timestamp;
        let horizon = now - self.window;
        let earlier = state
            .recent_messages
            .iter()
            .filter(|t| horizon <= **t && **t <= now)
            .count();
        // This message counts too.
        let count = earlier as f32 + 1.0;
        let allowed = self.max_messages as f32;

        // Linear past the allowed rate: twice the rate saturates.
        let score = ((count - allowed) / allowed).clamp(0.0, 1.0);

        Ok(SpamSignal::new(
            self.name(),
            score,
            1.0,
            format!(
                "{count} messages in {}s, {allowed} allowed",
                self.window.num_seconds()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, signals::tests::*, state::record_message};

    #[test]
    fn flood_rises_linearly_then_saturates() {
        let config = Config::default();
        let flood = Flood::new(&config.signals);
        let mut state = UserState::new(t(0));
        let mut scores = Vec::new();

        // 12 messages within a second; 5 are allowed per 10 seconds.
        for i in 0..12 {
            let event = msg(0, &format!("message {i}"));
            scores.push(flood.score(&event, &state).score);
            state = record_message(&state, &event, &config);
        }

        assert!(scores[..5].iter().all(|s| *s == 0.0));
        assert!((scores[5] - 0.2).abs() < 1e-6);
        assert!((scores[6] - 0.4).abs() < 1e-6);
        assert!(scores[5..10].windows(2).all(|w| w[0] < w[1]));
        assert!(scores[9..].iter().all(|s| *s == 1.0));
    }

    #[test]
    fn old_messages_do_not_count() {
        let config = Config::default();
        let flood = Flood::new(&config.signals);
        let mut state = UserState::new(t(0));
        for i in 0..10 {
            state = record_message(&state, &msg(i * 20, "slow and steady"), &config);
        }
        assert_eq!(flood.score(&msg(200, "still fine"), &state).score, 0.0);
    }
}
