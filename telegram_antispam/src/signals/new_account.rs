use chrono::TimeDelta;

use super::{names, SignalExtractor};
use crate::{
    config::SignalConfig,
    error::SignalError,
    state::UserState,
    types::{MessageEvent, SpamSignal},
};

/// Confidence when all we know is when we first saw the user, not when they joined.
const ASSUMED_JOIN_CONFIDENCE: f32 = 0.6;

/// Freshly joined users are the usual spammers.
pub struct NewAccount {
    maturity: TimeDelta,
}

impl NewAccount {
    #[must_use]
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            maturity: config.account_maturity(),
        }
    }
}

impl SignalExtractor for NewAccount {
    fn name(&self) -> &'static str {
        names::NEW_ACCOUNT
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        if event.is_join() {
            // Joining right now.
            return Ok(SpamSignal::new(self.name(), 1.0, 1.0, "just joined"));
        }

        let age = event.timestamp - state.joined_at;
        if age < TimeDelta::zero() {
            return Err(SignalError::Malformed(format!(
                "message sent {}s before the user joined",
                -age.num_seconds()
            )));
        }

        let maturity = self.maturity.num_seconds().max(1) as f32;
        let score = 1.0 - age.num_seconds() as f32 / maturity;
        let confidence = match state.join_observed {
            true => 1.0,
            false => ASSUMED_JOIN_CONFIDENCE,
        };

        Ok(SpamSignal::new(
            self.name(),
            score,
            confidence,
            format!(
                "{} for {}s",
                if state.join_observed {
                    "member"
                } else {
                    "seen"
                },
                age.num_seconds()
            ),
        ))
    }
}
