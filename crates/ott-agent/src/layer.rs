// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A `tracing` layer that turns the host application's log events into agent events.
//!
//! ```no_run
//! use ott_agent::{agent::Agent, config::Config, layer::AgentLayer};
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::init(Config::default())?;
//! let subscriber = tracing_subscriber::registry()
//!     .with(AgentLayer::new(&agent, tracing::Level::WARN));
//! tracing::subscriber::set_global_default(subscriber)?;
//!
//! tracing::error!(user_id = 123, "Something went wrong");
//! # Ok(())
//! # }
//! ```
//!
//! Fields other than `message` land in `extra`. A field recorded as an error
//! (`error = &err as &dyn Error`) makes the event an exception with the error's causes as frames.
//! The agent's own diagnostics are never forwarded.

use std::cell::Cell;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing_core::{Event as TracingEvent, Level as TracingLevel, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::agent::{cause_frames, Agent};
use crate::event::{ExceptionBlock, Level, Payload, Stacktrace};

const AGENT_TARGET: &str = "ott_agent";
const MESSAGE_FIELD: &str = "message";

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

/// Clears the re-entry flag even when capturing unwinds.
struct CaptureGuard;

impl CaptureGuard {
    fn enter() -> Option<Self> {
        if CAPTURING.with(|c| c.replace(true)) {
            None
        } else {
            Some(CaptureGuard)
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|c| c.set(false));
    }
}

#[must_use]
pub fn map_level(level: &TracingLevel) -> Level {
    if *level == TracingLevel::ERROR {
        Level::Error
    } else if *level == TracingLevel::WARN {
        Level::Warning
    } else if *level == TracingLevel::INFO {
        Level::Info
    } else {
        Level::Debug
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    extra: Map<String, Value>,
    exception: Option<ExceptionBlock>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        self.extra.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::from(value));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        self.exception = Some(ExceptionBlock {
            kind: field.name().to_string(),
            message: value.to_string(),
            stacktrace: Stacktrace {
                frames: cause_frames(value.source()),
            },
        });
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == MESSAGE_FIELD {
            self.message = Some(rendered);
        } else {
            self.insert(field, Value::from(rendered));
        }
    }
}

/// Captures every event at or above `min_level` through [`Agent::capture_event`].
///
/// Holds the agent weakly, like the panic integration.
pub struct AgentLayer {
    agent: Weak<Agent>,
    min_level: TracingLevel,
}

impl AgentLayer {
    #[must_use]
    pub fn new(agent: &Arc<Agent>, min_level: TracingLevel) -> Self {
        Self {
            agent: Arc::downgrade(agent),
            min_level,
        }
    }
}

impl<S: Subscriber> Layer<S> for AgentLayer {
    fn on_event(&self, event: &TracingEvent<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater
        if *metadata.level() > self.min_level || metadata.target().starts_with(AGENT_TARGET) {
            return;
        }
        let Some(_guard) = CaptureGuard::enter() else {
            return;
        };
        let Some(agent) = self.agent.upgrade() else {
            return;
        };

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut payload = match fields.exception {
            Some(exception) => Payload::exception(exception),
            None => Payload::default(),
        };
        payload.level = Some(map_level(metadata.level()));
        payload.message = fields.message;
        payload.extra = fields.extra;
        payload
            .extra
            .insert("logger".to_string(), Value::from(metadata.target()));
        agent.capture_event(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TransportMode};
    use crate::event::Event;
    use crate::transport::test_support::RecordingSender;
    use crate::wire::SendOutcome;
    use std::path::Path;
    use tracing_subscriber::layer::SubscriberExt;

    fn agent(dir: &Path) -> Arc<Agent> {
        let config = Config {
            api_key: "_not_a_real_key_".to_string(),
            server_url: "http://127.0.0.1:1".to_string(),
            transport: TransportMode::Disk,
            sample_rate: 1.0,
            high_memory_detected: u64::MAX,
            disk_queue_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let sender = Arc::new(RecordingSender::new(SendOutcome::Delivered(202)));
        Arc::new(Agent::with_sender(config, sender).unwrap())
    }

    fn queued(agent: &Agent) -> Vec<Event> {
        agent
            .queue_monitor()
            .get_recent_events(100)
            .into_iter()
            .map(|recent| recent.event)
            .collect()
    }

    fn find<'a>(events: &'a [Event], message: &str) -> &'a Event {
        events
            .iter()
            .find(|e| e.message.as_deref() == Some(message))
            .unwrap()
    }

    #[test]
    fn test_map_level() {
        assert_eq!(map_level(&TracingLevel::ERROR), Level::Error);
        assert_eq!(map_level(&TracingLevel::WARN), Level::Warning);
        assert_eq!(map_level(&TracingLevel::INFO), Level::Info);
        assert_eq!(map_level(&TracingLevel::DEBUG), Level::Debug);
        assert_eq!(map_level(&TracingLevel::TRACE), Level::Debug);
    }

    #[test]
    fn test_events_at_or_above_threshold_are_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = agent(tmp.path());
        let subscriber =
            tracing_subscriber::registry().with(AgentLayer::new(&agent, TracingLevel::WARN));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "checkout", user_id = 123, "Something went wrong");
            tracing::warn!(target: "checkout", duration = 2.5, "Slow response");
            tracing::info!(target: "checkout", "Cart loaded");
        });

        let events = queued(&agent);
        assert_eq!(events.len(), 2);

        let error = find(&events, "Something went wrong");
        assert_eq!(error.level, Level::Error);
        assert_eq!(error.extra["user_id"], 123);
        assert_eq!(error.extra["logger"], "checkout");

        let warning = find(&events, "Slow response");
        assert_eq!(warning.level, Level::Warning);
        assert_eq!(warning.extra["duration"], 2.5);
    }

    #[test]
    fn test_error_field_becomes_exception() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = agent(tmp.path());
        let subscriber =
            tracing_subscriber::registry().with(AgentLayer::new(&agent, TracingLevel::ERROR));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "cache.db");
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "cache", error = &err as &dyn Error, "Cache write failed");
        });

        let events = queued(&agent);
        let event = find(&events, "Cache write failed");
        let exception = event.exception.as_ref().unwrap();
        assert_eq!(exception.kind, "error");
        assert_eq!(exception.message, "cache.db");
        assert_eq!(event.level, Level::Error);
    }

    #[test]
    fn test_agent_diagnostics_and_reentry_are_not_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = agent(tmp.path());
        agent.add_before_send(|event: Event| -> Option<Event> {
            tracing::error!(target: "host_filter", "logged while capturing");
            Some(event)
        });
        let subscriber =
            tracing_subscriber::registry().with(AgentLayer::new(&agent, TracingLevel::WARN));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "ott_agent::wire", "WIRE | transient failure");
            tracing::error!(target: "payments", "Charge declined");
        });

        let events = queued(&agent);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message.as_deref(), Some("Charge declined"));
    }

    #[test]
    fn test_dropped_agent_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = agent(tmp.path());
        let layer = AgentLayer::new(&agent, TracingLevel::WARN);
        drop(agent);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "checkout", "nobody listens");
        });
        let queued = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("event_"))
            .count();
        assert_eq!(queued, 0);
    }
}
