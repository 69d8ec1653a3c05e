// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event envelope: the structured record shipped to the intake.
//!
//! An [`Event`] is assembled once by [`EventBuilder::build`] from a producer [`Payload`] plus
//! process context. Filters take the event by value and hand back a modified copy; once a
//! transport accepts it the event is not touched again.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, MaxRequestBodySize};
use crate::proc::{self, MemoryUsage};
use crate::profile::Profile;
use crate::{FILTERED, SDK_NAME, VERSION};

pub const PLATFORM: &str = "rust";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdk {
    pub name: String,
    pub version: String,
}

impl Default for Sdk {
    fn default() -> Self {
        Self {
            name: SDK_NAME.to_string(),
            version: VERSION.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stacktrace {
    pub frames: Vec<StackFrame>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stacktrace: Stacktrace,
}

/// Request context as shipped. `data` is the (possibly filtered) request body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_string: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Request facts supplied by the host for the current unit of work.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_string: String,
    pub body: Option<String>,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameVersion {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub current_kb: f64,
    pub peak_kb: f64,
    /// Change in resident memory since the agent was created.
    pub diff_usage_kb: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contexts {
    #[serde(default)]
    pub os: NameVersion,
    #[serde(default)]
    pub runtime: NameVersion,
    #[serde(default)]
    pub memory: MemoryContext,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub sdk: Sdk,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestContext>,
    #[serde(default)]
    pub contexts: Contexts,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl Event {
    /// A bare event with a fresh id and the current time.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            platform: PLATFORM.to_string(),
            sdk: Sdk::default(),
            environment: String::new(),
            release: String::new(),
            server_name: String::new(),
            kind: None,
            message: None,
            exception: None,
            request: None,
            contexts: Contexts::default(),
            tags: BTreeMap::new(),
            measurements: BTreeMap::new(),
            extra: Map::new(),
            duration_ms: None,
            profile: None,
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    #[must_use]
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Drops NaN and infinite floats. JSON writes them as `null`, which no longer decodes
    /// into an `f64` once the event comes back from the disk queue.
    pub fn retain_finite(&mut self) {
        self.measurements.retain(|name, value| {
            let finite = value.is_finite();
            if !finite {
                debug!("Dropping non-finite measurement {name}");
            }
            finite
        });
        if self.duration_ms.is_some_and(|d| !d.is_finite()) {
            self.duration_ms = None;
        }
        if let Some(profile) = self.profile.as_mut() {
            profile.retain_finite();
        }
    }
}

/// What a producer hands to `capture_event`. Everything is optional; the builder fills in the
/// process context around it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload {
    pub level: Option<Level>,
    pub kind: Option<String>,
    pub message: Option<String>,
    pub exception: Option<ExceptionBlock>,
    pub request: Option<RequestInfo>,
    pub tags: BTreeMap<String, Value>,
    pub measurements: BTreeMap<String, f64>,
    pub extra: Map<String, Value>,
    pub duration_ms: Option<f64>,
    pub profile: Option<Profile>,
}

impl Payload {
    #[must_use]
    pub fn message(message: impl Into<String>, level: Level) -> Self {
        Self {
            level: Some(level),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn exception(exception: ExceptionBlock) -> Self {
        Self {
            level: Some(Level::Error),
            exception: Some(exception),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_request(mut self, request: RequestInfo) -> Self {
        self.request = Some(request);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

pub(crate) fn round_kb(bytes: f64) -> f64 {
    (bytes / 1024.0 * 100.0).round() / 100.0
}

/// Assembles events from payloads plus process context.
pub struct EventBuilder {
    environment: String,
    release: String,
    server_name: String,
    max_request_body_size: MaxRequestBodySize,
    os: NameVersion,
    memory_baseline: MemoryUsage,
    memory_source: fn() -> MemoryUsage,
}

impl EventBuilder {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_memory_source(config, proc::get_memory_usage)
    }

    #[must_use]
    pub fn with_memory_source(config: &Config, memory_source: fn() -> MemoryUsage) -> Self {
        let (os_name, os_version) = proc::get_os_info();
        Self {
            environment: config.environment.clone(),
            release: config.release.clone(),
            server_name: config
                .server_name
                .clone()
                .unwrap_or_else(proc::get_hostname),
            max_request_body_size: config.max_request_body_size,
            os: NameVersion {
                name: os_name,
                version: os_version,
            },
            memory_baseline: memory_source(),
            memory_source,
        }
    }

    #[must_use]
    pub fn build(&self, payload: Payload) -> Event {
        let mut event = Event::new(payload.level.unwrap_or_default());
        event.environment.clone_from(&self.environment);
        event.release.clone_from(&self.release);
        event.server_name.clone_from(&self.server_name);
        event.contexts = self.contexts();
        event.kind = payload.kind;
        event.message = payload.message;
        event.exception = payload.exception;
        event.request = payload.request.map(|r| self.request_context(r));
        event.tags = payload.tags;
        event.measurements = payload.measurements;
        event.extra = payload.extra;
        event.duration_ms = payload.duration_ms;
        event.profile = payload.profile;
        event.retain_finite();
        event
    }

    #[allow(clippy::cast_precision_loss)]
    fn contexts(&self) -> Contexts {
        let usage = (self.memory_source)();
        let diff = usage.current_bytes as f64 - self.memory_baseline.current_bytes as f64;
        Contexts {
            os: self.os.clone(),
            runtime: NameVersion {
                name: PLATFORM.to_string(),
                version: VERSION.to_string(),
            },
            memory: MemoryContext {
                current_kb: round_kb(usage.current_bytes as f64),
                peak_kb: round_kb(usage.peak_bytes as f64),
                diff_usage_kb: round_kb(diff),
            },
        }
    }

    fn request_context(&self, request: RequestInfo) -> RequestContext {
        let data = match (request.body, self.max_request_body_size) {
            (_, MaxRequestBodySize::None) | (None, _) => None,
            (Some(body), size) => match size.limit() {
                Some(limit) if body.len() > limit => Some(FILTERED.to_string()),
                _ => Some(body),
            },
        };

        let mut env = BTreeMap::new();
        if let Some(addr) = request.remote_addr {
            env.insert("REMOTE_ADDR".to_string(), addr);
        }
        if let Some(agent) = request.user_agent {
            env.insert("HTTP_USER_AGENT".to_string(), agent);
        }

        RequestContext {
            url: request.url,
            method: request.method,
            headers: request.headers,
            query_string: request.query_string,
            data,
            env,
        }
    }
}
