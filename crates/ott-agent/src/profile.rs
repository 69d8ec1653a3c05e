// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Profile compaction.
//!
//! A raw trace repeats the same call stacks thousands of times. [`ProfileEncoder::encode`]
//! turns it into index arrays: each distinct `(file, line)` becomes one [`Frame`], each
//! distinct frame sequence one stack, and each sample a `(stack_id, elapsed_ns)` pair. The
//! output grows with the number of distinct stacks, not with the number of samples.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, ProfileMode};

/// One call site as reported by the host profiler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub file: String,
    pub line: u32,
    pub class: Option<String>,
    pub function: Option<String>,
}

/// One profiler observation. `timestamp` is seconds since the profile started.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawSample {
    pub timestamp: f64,
    pub frames: Vec<RawFrame>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub function: String,
    pub lineno: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub stack_id: usize,
    pub elapsed_ns: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub frames: Vec<Frame>,
    /// Frame indices per distinct stack.
    pub stacks: Vec<Vec<usize>>,
    pub samples: Vec<Sample>,
    /// Timestamp of the last encoded sample, in seconds.
    pub duration: f64,
    #[serde(default)]
    pub mode: String,
    /// Sampling period the host profiler ran with, in seconds.
    #[serde(default)]
    pub sample_period: f64,
}

impl Profile {
    /// Zeroes float fields JSON cannot carry.
    pub(crate) fn retain_finite(&mut self) {
        if !self.duration.is_finite() {
            self.duration = 0.0;
        }
        if !self.sample_period.is_finite() {
            self.sample_period = 0.0;
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProfileEncoder {
    pub mode: ProfileMode,
    /// Seconds between two samples, handed to the host profiler and recorded on the output.
    pub sample_period: f64,
    pub max_stack_depth: usize,
    /// Samples later than this many seconds are not encoded.
    pub max_duration: f64,
}

impl Default for ProfileEncoder {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ProfileEncoder {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.profile_mode,
            sample_period: config.profile_sample_rate,
            max_stack_depth: config.profile_max_stack_depth,
            max_duration: config.profile_max_duration,
        }
    }

    #[must_use]
    pub fn encode<I>(&self, samples: I) -> Profile
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut frame_index: HashMap<(PathBuf, u32), usize> = HashMap::new();
        let mut stack_index: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut profile = Profile {
            mode: self.mode.as_str().to_string(),
            sample_period: self.sample_period,
            ..Default::default()
        };

        for sample in samples {
            if !sample.timestamp.is_finite() {
                debug!("Skipping profile sample with timestamp {}", sample.timestamp);
                continue;
            }
            if sample.timestamp > self.max_duration {
                break;
            }

            let stack: Vec<usize> = sample
                .frames
                .iter()
                .take(self.max_stack_depth)
                .map(|raw| {
                    let key = (absolute(&raw.file), raw.line);
                    *frame_index.entry(key).or_insert_with(|| {
                        profile.frames.push(Frame {
                            filename: raw.file.clone(),
                            module: raw.class.clone(),
                            function: label(raw),
                            lineno: raw.line,
                        });
                        profile.frames.len() - 1
                    })
                })
                .collect();

            let stack_id = match stack_index.get(&stack) {
                Some(id) => *id,
                None => {
                    let id = profile.stacks.len();
                    profile.stacks.push(stack.clone());
                    stack_index.insert(stack, id);
                    id
                }
            };

            profile.samples.push(Sample {
                stack_id,
                elapsed_ns: to_nanos(sample.timestamp),
            });
            profile.duration = sample.timestamp;
        }
        profile.retain_finite();
        profile
    }
}

fn absolute(file: &str) -> PathBuf {
    std::path::absolute(file).unwrap_or_else(|_| PathBuf::from(file))
}

fn label(frame: &RawFrame) -> String {
    match (&frame.class, &frame.function) {
        (Some(class), Some(function)) => format!("{class}::{function}"),
        (_, Some(function)) => function.clone(),
        _ => frame.file.clone(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_nanos(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1_000_000_000.0).round() as u64
    } else {
        0
    }
}
