// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Before-send filters.
//!
//! A [`FilterChain`] runs its filters in registration order. A filter returning `None` drops
//! the event: later filters do not run and nothing is delivered.

pub mod memory_usage;
pub mod rate_limit;
pub mod sensitive_data;
pub mod slow_request;

use tracing::debug;

use crate::config::Config;
use crate::event::Event;

pub use memory_usage::MemoryUsageFilter;
pub use rate_limit::RateLimitFilter;
pub use sensitive_data::SensitiveDataFilter;
pub use slow_request::SlowRequestOnlyFilter;

/// A policy applied to an event before delivery. Returns the (possibly modified) event, or
/// `None` to suppress delivery.
pub trait BeforeSendFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, event: Event) -> Option<Event>;
}

impl<F> BeforeSendFilter for F
where
    F: Fn(Event) -> Option<Event> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "closure"
    }

    fn apply(&self, event: Event) -> Option<Event> {
        self(event)
    }
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn BeforeSendFilter>>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Redaction, slow-request gating, sampling and memory tagging, in that order.
    #[must_use]
    pub fn standard(config: &Config) -> Self {
        let mut chain = Self::new();
        chain.push(SensitiveDataFilter::default());
        chain.push(SlowRequestOnlyFilter::new(config.slow_request));
        chain.push(RateLimitFilter::new(config.sample_rate));
        chain.push(MemoryUsageFilter::new(config.high_memory_detected));
        chain
    }

    pub fn push(&mut self, filter: impl BeforeSendFilter + 'static) {
        self.filters.push(Box::new(filter));
    }

    /// Inserts at `index`, clamped to the end of the chain.
    pub fn insert(&mut self, index: usize, filter: impl BeforeSendFilter + 'static) {
        let index = index.min(self.filters.len());
        self.filters.insert(index, Box::new(filter));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    #[must_use]
    pub fn apply(&self, mut event: Event) -> Option<Event> {
        for filter in &self.filters {
            match filter.apply(event) {
                Some(next) => event = next,
                None => {
                    debug!("FILTER | {} dropped the event", filter.name());
                    return None;
                }
            }
        }
        Some(event)
    }
}
