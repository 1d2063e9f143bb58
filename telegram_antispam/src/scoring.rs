//! Weighing signals into a single verdict.

use crate::{
    config::{ScoringConfig, WeightConfig},
    state::{TrustLevel, UserState},
    types::{Classification, SpamSignal, Verdict},
};

pub struct Aggregator {
    weights: WeightConfig,
    scoring: ScoringConfig,
}

impl Aggregator {
    #[must_use]
    pub fn new(weights: WeightConfig, scoring: ScoringConfig) -> Self {
        Self { weights, scoring }
    }

    fn trust_multiplier(&self, trust: TrustLevel) -> f32 {
        match trust {
            TrustLevel::New => self.scoring.new_multiplier,
            TrustLevel::Normal => self.scoring.normal_multiplier,
            TrustLevel::Trusted => self.scoring.trusted_multiplier,
        }
    }

    #[must_use]
    pub fn classify(&self, score: f32) -> Classification {
        if score >= self.scoring.spam_threshold {
            Classification::Spam
        } else if score >= self.scoring.suspicious_threshold {
            Classification::Suspicious
        } else {
            Classification::Clean
        }
    }

    /// Combine the signals of one message into a verdict, taking the sender's trust into account.
    #[must_use]
    pub fn aggregate(&self, mut signals: Vec<SpamSignal>, state: &UserState) -> Verdict {
        // Float addition isn't associative, so fix the order.
        signals.sort_by(|a, b| a.name.cmp(b.name));

        let sum: f32 = signals
            .iter()
            .map(|signal| self.weights.get(signal.name) * signal.effective_score())
            .sum();

        let score = sum * self.trust_multiplier(state.trust_level);
        let aggregate_score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };

        signals.retain(|signal| signal.effective_score() > 0.0);

        Verdict {
            aggregate_score,
            triggered_signals: signals,
            classification: self.classify(aggregate_score),
        }
    }
}
