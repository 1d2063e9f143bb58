use super::{names, SignalExtractor};
use crate::{
    config::SignalConfig,
    error::SignalError,
    state::UserState,
    types::{MessageEvent, SpamSignal},
};

/// Messages that are mostly links and mentions.
pub struct LinkDensity {
    per_link: f32,
    density_scale: f32,
    cap: f32,
}

impl LinkDensity {
    #[must_use]
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            per_link: config.link_score_per_link,
            density_scale: config.link_density_scale,
            cap: config.link_score_cap,
        }
    }
}

impl SignalExtractor for LinkDensity {
    fn name(&self) -> &'static str {
        names::LINKS
    }

    fn try_score(
        &self,
        event: &MessageEvent,
        _state: &UserState,
    ) -> Result<SpamSignal, SignalError> {
        let links = event.links().len();
        if links == 0 {
            return Ok(SpamSignal::new(self.name(), 0.0, 1.0, "no links"));
        }

        // Links hidden behind text don't show up as words, so there's at least as many words
        // as there are links.
        let words = event
            .text_full()
            .map_or(0, |text| text.split_whitespace().count())
            .max(links);
        let density = links as f32 / words as f32;

        let score = (links as f32 * self.per_link + density * self.density_scale).min(self.cap);

        Ok(SpamSignal::new(
            self.name(),
            score,
            1.0,
            format!("{links} links in {words} words"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, signals::tests::*};

    #[test]
    fn more_links_more_score() {
        let config = Config::default();
        let link_density = LinkDensity::new(&config.signals);
        let state = UserState::new(t(0));
        let score = |text| link_density.score(&msg(0, text), &state).score;

        assert_eq!(score("no links in here at all"), 0.0);

        let one_in_many = score("here is the article i was talking about earlier: example.com");
        let one_alone = score("example.com");
        let five = score("a.com b.com c.com d.com e.com");

        assert!(one_in_many > 0.0);
        assert!(one_alone > one_in_many);
        assert_eq!(five, 1.0);
    }

    #[test]
    fn capped() {
        let mut signals = Config::default().signals;
        signals.link_score_cap = 0.5;
        let link_density = LinkDensity::new(&signals);
        let signal = link_density.score(&msg(0, "a.com b.com c.com"), &UserState::new(t(0)));
        assert_eq!(signal.score, 0.5);
    }
}
