// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use crate::event::{round_kb, Event, Level};
use crate::filter::BeforeSendFilter;
use crate::proc;

pub const MEMORY_PEAK_MEASUREMENT: &str = "memory_peak_kb";

type PeakSource = Box<dyn Fn() -> u64 + Send + Sync>;

/// Records peak memory as `measurements.memory_peak_kb`. Above the threshold the event is
/// tagged `memory: high` and its level is raised to at least `warning`.
pub struct MemoryUsageFilter {
    threshold_bytes: u64,
    peak_source: PeakSource,
}

impl MemoryUsageFilter {
    #[must_use]
    pub fn new(threshold_bytes: u64) -> Self {
        Self::with_peak_source(threshold_bytes, || proc::get_memory_usage().peak_bytes)
    }

    #[must_use]
    pub fn with_peak_source(
        threshold_bytes: u64,
        peak_source: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            threshold_bytes,
            peak_source: Box::new(peak_source),
        }
    }
}

impl BeforeSendFilter for MemoryUsageFilter {
    fn name(&self) -> &'static str {
        "memory_usage"
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply(&self, mut event: Event) -> Option<Event> {
        let peak = (self.peak_source)();
        event
            .measurements
            .insert(MEMORY_PEAK_MEASUREMENT.to_string(), round_kb(peak as f64));
        if peak > self.threshold_bytes {
            event
                .tags
                .insert("memory".to_string(), Value::from("high"));
            event.level = event.level.max(Level::Warning);
        }
        Some(event)
    }
}
