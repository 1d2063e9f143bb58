//! Deployment configuration, read from a TOML file. Every value has a default, so an empty or
//! missing file is a valid configuration.

use std::{path::Path, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;

use crate::error::ConfigError;

/// Ten years. Anything longer than that in the config is surely a typo.
const MAX_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

fn delta(secs: u64) -> TimeDelta {
    // Validation keeps this far away from overflowing.
    TimeDelta::seconds(secs.min(MAX_SECONDS) as i64)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `sqlx` connection string of the SQLite database committed state is saved into.
    pub database_path: String,
    pub signals: SignalConfig,
    pub weights: WeightConfig,
    pub scoring: ScoringConfig,
    pub policy: PolicyConfig,
    pub state: StateConfig,
    pub executor: ExecutorConfig,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "sqlite:antispam.sqlite".to_string(),
            signals: SignalConfig::default(),
            weights: WeightConfig::default(),
            scoring: ScoringConfig::default(),
            policy: PolicyConfig::default(),
            state: StateConfig::default(),
            executor: ExecutorConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    ///
    /// # Errors
    /// Errors if the text is not valid TOML of the right shape, or if [`Self::validate`] fails.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a file. A missing file yields the default configuration.
    ///
    /// # Errors
    /// Errors if the file exists but can't be read or parsed, or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults.", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check that the values make sense together.
    ///
    /// # Errors
    /// Errors with a description of the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        macro_rules! ensure {
            ($cond: expr, $($desc: tt)+) => {
                if !$cond {
                    return Err(ConfigError::Invalid(format!($($desc)+)));
                }
            };
        }

        let scoring = &self.scoring;
        ensure!(
            0.0 < scoring.suspicious_threshold
                && scoring.suspicious_threshold < scoring.spam_threshold
                && scoring.spam_threshold <= 1.0,
            "thresholds must satisfy 0 < suspicious ({}) < spam ({}) <= 1",
            scoring.suspicious_threshold,
            scoring.spam_threshold
        );
        for (name, multiplier) in [
            ("new", scoring.new_multiplier),
            ("normal", scoring.normal_multiplier),
            ("trusted", scoring.trusted_multiplier),
        ] {
            ensure!(
                multiplier.is_finite() && multiplier >= 0.0,
                "trust multiplier for {name} users must be a non-negative number"
            );
        }

        for (name, weight) in self.weights.iter() {
            ensure!(
                weight.is_finite() && weight >= 0.0,
                "weight of signal {name} must be a non-negative number"
            );
        }

        let policy = &self.policy;
        ensure!(
            policy.mute_after < policy.terminal_after,
            "mute_after ({}) must be less than terminal_after ({})",
            policy.mute_after,
            policy.terminal_after
        );
        ensure!(
            policy.base_mute_secs > 0 && policy.base_mute_secs <= policy.max_mute_secs,
            "base_mute_secs must be positive and at most max_mute_secs"
        );

        let signals = &self.signals;
        ensure!(signals.flood_max_messages > 0, "flood_max_messages must be positive");
        ensure!(signals.max_timestamps > 0, "max_timestamps must be positive");
        ensure!(signals.max_fingerprints > 0, "max_fingerprints must be positive");
        ensure!(
            signals.link_score_cap > 0.0 && signals.link_score_cap <= 1.0,
            "link_score_cap must be within (0, 1]"
        );

        ensure!(self.executor.max_attempts >= 1, "max_attempts must be at least 1");
        ensure!(
            self.executor.request_timeout_ms > 0,
            "request_timeout_ms must be positive"
        );
        ensure!(
            self.pipeline.queue_size_per_chat > 0 && self.pipeline.max_concurrent > 0,
            "queue_size_per_chat and max_concurrent must be positive"
        );

        for (name, secs) in [
            ("flood_window_secs", signals.flood_window_secs),
            ("duplicate_window_secs", signals.duplicate_window_secs),
            ("account_maturity_secs", signals.account_maturity_secs),
            ("max_mute_secs", policy.max_mute_secs),
            ("cooldown_secs", policy.cooldown_secs),
            ("ttl_secs", self.state.ttl_secs),
            ("sweep_interval_secs", self.state.sweep_interval_secs),
            ("save_interval_secs", self.state.save_interval_secs),
        ] {
            ensure!(
                0 < secs && secs <= MAX_SECONDS,
                "{name} must be positive and at most ten years"
            );
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalConfig {
    /// Window the flood signal counts messages in.
    pub flood_window_secs: u64,
    /// How many messages within the window are fine.
    pub flood_max_messages: u32,
    /// How long message fingerprints are remembered for duplicate detection.
    pub duplicate_window_secs: u64,
    /// Bound on remembered message timestamps per user.
    pub max_timestamps: usize,
    /// Bound on remembered message fingerprints per user.
    pub max_fingerprints: usize,
    /// Time after joining past which a user stops being considered new.
    pub account_maturity_secs: u64,
    /// Score each link or mention adds.
    pub link_score_per_link: f32,
    /// Score added for links making up the whole message, scaled by their share of words.
    pub link_density_scale: f32,
    pub link_score_cap: f32,
    /// Case insensitive substrings of names that are a dead giveaway on join.
    pub bad_name_patterns: Vec<String>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            flood_window_secs: 10,
            flood_max_messages: 5,
            duplicate_window_secs: 10 * 60,
            max_timestamps: 64,
            max_fingerprints: 16,
            account_maturity_secs: 24 * 60 * 60,
            link_score_per_link: 0.2,
            link_density_scale: 1.0,
            link_score_cap: 1.0,
            bad_name_patterns: ["airdrop", "crypto signal", "free nft", "giveaway bot"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SignalConfig {
    #[must_use]
    pub fn flood_window(&self) -> TimeDelta {
        delta(self.flood_window_secs)
    }
    #[must_use]
    pub fn duplicate_window(&self) -> TimeDelta {
        delta(self.duplicate_window_secs)
    }
    #[must_use]
    pub fn account_maturity(&self) -> TimeDelta {
        delta(self.account_maturity_secs)
    }
}

/// Weights of each signal in the aggregate score.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeightConfig {
    pub flood: f32,
    pub duplicate: f32,
    pub new_account: f32,
    pub links: f32,
    pub prohibited_words: f32,
    pub join_spam: f32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            flood: 0.5,
            duplicate: 0.1,
            new_account: 0.1,
            links: 0.6,
            prohibited_words: 1.0,
            join_spam: 1.0,
        }
    }
}

impl WeightConfig {
    /// Weight for a signal of this name. Unknown signals weigh nothing.
    #[must_use]
    pub fn get(&self, name: &str) -> f32 {
        self.iter()
            .find_map(|(n, w)| (n == name).then_some(w))
            .unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> {
        use crate::signals::names;
        [
            (names::FLOOD, self.flood),
            (names::DUPLICATE, self.duplicate),
            (names::NEW_ACCOUNT, self.new_account),
            (names::LINKS, self.links),
            (names::PROHIBITED_WORDS, self.prohibited_words),
            (names::JOIN_SPAM, self.join_spam),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// T1: scores at or above this are suspicious.
    pub suspicious_threshold: f32,
    /// T2: scores at or above this are spam.
    pub spam_threshold: f32,
    pub new_multiplier: f32,
    pub normal_multiplier: f32,
    pub trusted_multiplier: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            suspicious_threshold: 0.3,
            spam_threshold: 0.7,
            new_multiplier: 1.25,
            normal_multiplier: 1.0,
            trusted_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalAction {
    Kick,
    Ban,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// K1: violations after which spam gets the sender muted.
    pub mute_after: u32,
    /// K2: violations after which spam gets the sender removed for good.
    pub terminal_after: u32,
    pub terminal_action: TerminalAction,
    /// Mute length at K1 violations. Doubles with each violation past that.
    pub base_mute_secs: u64,
    pub max_mute_secs: u64,
    /// How long after an action later actions can't be milder than it.
    pub cooldown_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mute_after: 2,
            terminal_after: 4,
            terminal_action: TerminalAction::Ban,
            base_mute_secs: 10 * 60,
            max_mute_secs: 24 * 60 * 60,
            cooldown_secs: 60 * 60,
        }
    }
}

impl PolicyConfig {
    #[must_use]
    pub fn cooldown(&self) -> TimeDelta {
        delta(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// Per-user state with no activity for this long is forgotten.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub save_interval_secs: u64,
    /// Clean messages after which a user stops being new.
    pub trusted_message_count: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            save_interval_secs: 5 * 60,
            trusted_message_count: 3,
        }
    }
}

impl StateConfig {
    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        delta(self.ttl_secs)
    }
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
    #[must_use]
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Attempts per action, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Requests taking longer than this count as a transient failure.
    pub request_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `retry` (starting at 1).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub queue_size_per_chat: usize,
    /// Events processed at the same time, across all chats.
    pub max_concurrent: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size_per_chat: 256,
            max_concurrent: 64,
            shutdown_grace_secs: 10,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
