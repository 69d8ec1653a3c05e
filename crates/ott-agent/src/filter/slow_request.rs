// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use crate::event::Event;
use crate::filter::BeforeSendFilter;

/// Drops events for requests faster than a threshold.
///
/// The duration is the event's `duration_ms` when set, otherwise the time elapsed since the
/// filter was created (the start of the unit of work). A threshold of 0 admits everything.
pub struct SlowRequestOnlyFilter {
    threshold_ms: f64,
    started_at: Instant,
}

impl SlowRequestOnlyFilter {
    #[must_use]
    pub fn new(threshold_ms: f64) -> Self {
        Self::started_at(threshold_ms, Instant::now())
    }

    #[must_use]
    pub fn started_at(threshold_ms: f64, started_at: Instant) -> Self {
        Self {
            threshold_ms,
            started_at,
        }
    }
}

impl BeforeSendFilter for SlowRequestOnlyFilter {
    fn name(&self) -> &'static str {
        "slow_request"
    }

    fn apply(&self, event: Event) -> Option<Event> {
        if self.threshold_ms <= 0.0 {
            return Some(event);
        }
        let duration = event
            .duration_ms
            .unwrap_or_else(|| self.started_at.elapsed().as_secs_f64() * 1000.0);
        (duration >= self.threshold_ms).then_some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use std::time::Duration;

    fn timed(duration_ms: f64) -> Event {
        let mut event = Event::new(Level::Info);
        event.duration_ms = Some(duration_ms);
        event
    }

    #[test]
    fn test_zero_threshold_admits_everything() {
        assert!(SlowRequestOnlyFilter::new(0.0).apply(timed(0.0)).is_some());
        assert!(SlowRequestOnlyFilter::new(0.0)
            .apply(Event::new(Level::Info))
            .is_some());
    }

    #[test]
    fn test_fast_request_dropped() {
        assert!(SlowRequestOnlyFilter::new(500.0).apply(timed(120.0)).is_none());
    }

    #[test]
    fn test_slow_request_kept() {
        assert!(SlowRequestOnlyFilter::new(500.0).apply(timed(500.0)).is_some());
        assert!(SlowRequestOnlyFilter::new(500.0).apply(timed(2500.0)).is_some());
    }

    #[test]
    fn test_falls_back_to_elapsed_time() {
        let start = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap_or_else(Instant::now);
        let filter = SlowRequestOnlyFilter::started_at(1000.0, start);
        if start.elapsed() >= Duration::from_secs(1) {
            assert!(filter.apply(Event::new(Level::Info)).is_some());
        }

        let fresh = SlowRequestOnlyFilter::new(60_000.0);
        assert!(fresh.apply(Event::new(Level::Info)).is_none());
    }
}
