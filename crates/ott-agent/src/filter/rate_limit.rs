// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use serde_json::Value;

use crate::event::Event;
use crate::filter::BeforeSendFilter;

pub const SAMPLE_RATE_TAG: &str = "sample_rate";

/// Probabilistic sampling. Kept events are tagged with the rate used.
pub struct RateLimitFilter {
    sample_rate: f64,
    rng: Mutex<fastrand::Rng>,
}

impl RateLimitFilter {
    /// `sample_rate` is clamped to `[0, 1]`; NaN counts as 0.
    #[must_use]
    pub fn new(sample_rate: f64) -> Self {
        Self::with_rng(sample_rate, fastrand::Rng::new())
    }

    #[must_use]
    pub fn with_seed(sample_rate: f64, seed: u64) -> Self {
        Self::with_rng(sample_rate, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(sample_rate: f64, rng: fastrand::Rng) -> Self {
        let sample_rate = if sample_rate.is_nan() {
            0.0
        } else {
            sample_rate.clamp(0.0, 1.0)
        };
        Self {
            sample_rate,
            rng: Mutex::new(rng),
        }
    }

    #[must_use]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn draw(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.f64(),
            Err(poisoned) => poisoned.into_inner().f64(),
        }
    }
}

impl BeforeSendFilter for RateLimitFilter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn apply(&self, mut event: Event) -> Option<Event> {
        if self.sample_rate >= 1.0 {
            return Some(event);
        }
        if self.sample_rate <= 0.0 {
            return None;
        }
        if self.draw() >= self.sample_rate {
            return None;
        }
        event
            .tags
            .insert(SAMPLE_RATE_TAG.to_string(), Value::from(self.sample_rate));
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;

    #[test]
    fn test_zero_rate_always_drops() {
        let filter = RateLimitFilter::new(0.0);
        assert!((0..1000).all(|_| filter.apply(Event::new(Level::Error)).is_none()));
    }

    #[test]
    fn test_full_rate_always_keeps_untagged() {
        let filter = RateLimitFilter::new(1.0);
        for _ in 0..1000 {
            let event = filter.apply(Event::new(Level::Error)).unwrap();
            assert!(!event.tags.contains_key(SAMPLE_RATE_TAG));
        }
    }

    #[test]
    fn test_rate_is_clamped() {
        assert!((RateLimitFilter::new(7.5).sample_rate() - 1.0).abs() < f64::EPSILON);
        assert!(RateLimitFilter::new(-3.0).sample_rate().abs() < f64::EPSILON);
        assert!(RateLimitFilter::new(f64::NAN).sample_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_keep_fraction_converges() {
        let filter = RateLimitFilter::with_seed(0.3, 42);
        let trials = 20_000;
        let kept = (0..trials)
            .filter(|_| filter.apply(Event::new(Level::Info)).is_some())
            .count();
        #[allow(clippy::cast_precision_loss)]
        let fraction = kept as f64 / f64::from(trials);
        assert!((fraction - 0.3).abs() < 0.02, "kept fraction {fraction}");
    }

    #[test]
    fn test_kept_event_is_tagged() {
        let filter = RateLimitFilter::with_seed(0.5, 7);
        let event = (0..100)
            .find_map(|_| filter.apply(Event::new(Level::Info)))
            .unwrap();
        assert_eq!(event.tags[SAMPLE_RATE_TAG], Value::from(0.5));
    }
}
