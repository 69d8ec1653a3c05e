// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent: an explicitly constructed context value that producers hand events to.
//!
//! ```no_run
//! use ott_agent::{agent::Agent, config::Config, event::Level};
//!
//! let config = Config {
//!     api_key: "key".to_string(),
//!     server_url: "https://intake.example.com".to_string(),
//!     ..Default::default()
//! };
//! let agent = Agent::new(config).expect("valid configuration");
//! agent.capture_message("cache warmed", Level::Info);
//! agent.shutdown();
//! ```
//!
//! Nothing in here panics or returns delivery errors to the producer. Network and disk faults
//! end up as retries or drops.

use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, TransportMode};
use crate::disk_queue::{FlushReport, QueueSettings};
use crate::error::AgentError;
use crate::event::{EventBuilder, ExceptionBlock, Level, Payload, StackFrame, Stacktrace};
use crate::filter::{BeforeSendFilter, FilterChain};
use crate::integration::{IntegrationManager, PanicIntegration};
use crate::profile::{ProfileEncoder, RawSample};
use crate::queue_monitor::{QueueMonitor, QueueStats};
use crate::transport::deferred::ResponseRelease;
use crate::transport::Transport;
use crate::wire::{EventSender, WireSender};
use crate::UNKNOWN;

pub const PROFILE_EVENT_TYPE: &str = "profile";

pub struct Agent {
    config: Config,
    builder: EventBuilder,
    filters: RwLock<FilterChain>,
    sender: Arc<dyn EventSender>,
    transport: Transport,
    profile_encoder: ProfileEncoder,
    shut_down: AtomicBool,
}

impl Agent {
    /// Validates `config` and wires the pipeline with a [`WireSender`].
    pub fn new(config: Config) -> Result<Self, AgentError> {
        let sender = Arc::new(WireSender::new(&config));
        Self::with_sender(config, sender)
    }

    /// Same as [`Agent::new`] with a caller supplied sender.
    pub fn with_sender(config: Config, sender: Arc<dyn EventSender>) -> Result<Self, AgentError> {
        config.validate()?;
        let transport = Transport::from_config(&config, sender.clone())?;
        debug!(
            "Agent ready: transport={} environment={}",
            config.transport, config.environment
        );
        Ok(Self {
            builder: EventBuilder::new(&config),
            filters: RwLock::new(FilterChain::standard(&config)),
            profile_encoder: ProfileEncoder::from_config(&config),
            sender,
            transport,
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Builds a shared agent and activates the integrations its configuration enables.
    pub fn init(config: Config) -> Result<Arc<Self>, AgentError> {
        let agent = Arc::new(Self::new(config)?);
        agent.integrations().activate_all();
        Ok(agent)
    }

    /// Integrations enabled by the configuration, registered but not activated.
    #[must_use]
    pub fn integrations(self: &Arc<Self>) -> IntegrationManager {
        let mut manager = IntegrationManager::new();
        if self.config.capture_panics {
            manager.add(PanicIntegration::new(self));
        }
        manager
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn transport_mode(&self) -> TransportMode {
        self.transport.mode()
    }

    /// Appends a filter after the standard ones.
    pub fn add_before_send(&self, filter: impl BeforeSendFilter + 'static) {
        match self.filters.write() {
            Ok(mut filters) => filters.push(filter),
            Err(poisoned) => poisoned.into_inner().push(filter),
        }
    }

    pub fn insert_before_send(&self, index: usize, filter: impl BeforeSendFilter + 'static) {
        match self.filters.write() {
            Ok(mut filters) => filters.insert(index, filter),
            Err(poisoned) => poisoned.into_inner().insert(index, filter),
        }
    }

    /// Lets the host release its response before deferred delivery starts. Only meaningful in
    /// async mode, elsewhere the hook is dropped.
    pub fn set_response_release(&self, release: ResponseRelease) {
        match &self.transport {
            Transport::Async(transport) => transport.set_response_release(release),
            _ => debug!("Response release hook ignored in {} mode", self.transport.mode()),
        }
    }

    /// Builds an event from `payload`, runs the filter chain and hands the survivor to the
    /// transport. Returns the event id when it was handed over.
    pub fn capture_event(&self, payload: Payload) -> Option<Uuid> {
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Agent is shut down, ignoring event");
            return None;
        }

        let event = self.builder.build(payload);
        let mut event = match self.filters.read() {
            Ok(filters) => filters.apply(event),
            Err(poisoned) => poisoned.into_inner().apply(event),
        }?;
        // Custom filters may have written NaN measurements
        event.retain_finite();

        let id = event.event_id();
        self.transport.enqueue(event);
        Some(id)
    }

    pub fn capture_message(&self, message: impl Into<String>, level: Level) -> Option<Uuid> {
        self.capture_event(Payload::message(message, level))
    }

    /// Captures an error with its `source()` chain as frames, outermost cause first.
    pub fn capture_error<E>(&self, error: &E) -> Option<Uuid>
    where
        E: Error + ?Sized,
    {
        self.capture_event(Payload::exception(ExceptionBlock {
            kind: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            stacktrace: Stacktrace {
                frames: cause_frames(error.source()),
            },
        }))
    }

    /// Encodes a sampled trace and captures it as a `profile` event. Does nothing unless
    /// profiling is enabled.
    pub fn capture_profile<I>(&self, samples: I, duration_ms: f64) -> Option<Uuid>
    where
        I: IntoIterator<Item = RawSample>,
    {
        if !self.config.profile {
            debug!("Profiling disabled, ignoring profile");
            return None;
        }
        let profile = self.profile_encoder.encode(samples);
        debug!(
            "Encoded profile: frames={} stacks={} samples={}",
            profile.frames.len(),
            profile.stacks.len(),
            profile.samples.len()
        );
        self.capture_event(Payload {
            level: Some(Level::Info),
            kind: Some(PROFILE_EVENT_TYPE.to_string()),
            profile: Some(profile),
            duration_ms: Some(duration_ms),
            ..Default::default()
        })
    }

    /// End of the unit of work: sends events buffered by the async transport. Returns how many
    /// were sent.
    pub fn finish_unit_of_work(&self) -> usize {
        self.transport.finish()
    }

    /// Delivers queued events.
    pub fn flush(&self) -> io::Result<FlushReport> {
        self.transport.flush_queue()
    }

    #[must_use]
    pub fn queue_monitor(&self) -> QueueMonitor {
        QueueMonitor::new(
            QueueSettings::from_config(&self.config),
            Some(self.sender.clone()),
        )
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let stats = self.queue_monitor().get_stats();
        debug!(
            "Queue stats: files={} size={:.2}MB is_full={}",
            stats.total_files, stats.size_mb, stats.is_full
        );
        stats
    }

    /// Sends pending async events and stops accepting new ones. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let sent = self.transport.finish();
        if let Transport::Disk(_) = self.transport {
            if let Some(queue) = self.transport.queue() {
                match queue.list() {
                    Ok(items) if !items.is_empty() => {
                        debug!("{} event(s) left in {}", items.len(), queue.dir().display());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Cannot inspect queue at shutdown: {e}"),
                }
            }
        }
        sent
    }
}

/// One frame per cause, outermost first.
pub(crate) fn cause_frames(mut source: Option<&(dyn Error + 'static)>) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    while let Some(cause) = source {
        frames.push(StackFrame {
            filename: UNKNOWN.to_string(),
            lineno: None,
            function: cause.to_string(),
            module: None,
        });
        source = cause.source();
    }
    frames
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, RequestInfo};
    use crate::profile::RawFrame;
    use crate::transport::test_support::RecordingSender;
    use crate::wire::SendOutcome;
    use serial_test::serial;
    use std::path::Path;

    fn config(dir: &Path, transport: TransportMode) -> Config {
        Config {
            api_key: "_not_a_real_key_".to_string(),
            server_url: "http://127.0.0.1:1".to_string(),
            transport,
            sample_rate: 1.0,
            high_memory_detected: u64::MAX,
            disk_queue_dir: dir.to_path_buf(),
            queue_backoff_base_ms: 0,
            queue_backoff_max_ms: 0,
            ..Default::default()
        }
    }

    fn agent(dir: &Path, transport: TransportMode) -> (Agent, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new(SendOutcome::Delivered(202)));
        let agent = Agent::with_sender(config(dir, transport), sender.clone()).unwrap();
        (agent, sender)
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        let result = Agent::new(Config {
            server_url: "https://intake.example.com".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn test_sync_capture_sends_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Sync);
        assert!(agent.capture_message("hello", Level::Info).is_some());
        assert_eq!(sender.seen(), vec!["hello"]);
    }

    #[test]
    fn test_async_capture_waits_for_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Async);
        agent.capture_message("one", Level::Info);
        agent.capture_message("two", Level::Info);
        assert!(sender.seen().is_empty());
        assert_eq!(agent.finish_unit_of_work(), 2);
        assert_eq!(sender.seen(), vec!["one", "two"]);
    }

    #[test]
    fn test_disk_capture_waits_for_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Disk);
        agent.capture_message("queued", Level::Warning);
        assert!(sender.seen().is_empty());
        assert_eq!(agent.stats().total_files, 1);

        let report = agent.flush().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sender.seen(), vec!["queued"]);
        assert_eq!(agent.stats().total_files, 0);
    }

    #[test]
    fn test_filter_drop_suppresses_delivery() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Sync);
        agent.add_before_send(|event: Event| -> Option<Event> {
            (event.level != Level::Debug).then_some(event)
        });
        assert!(agent.capture_message("noise", Level::Debug).is_none());
        assert!(agent.capture_message("signal", Level::Error).is_some());
        assert_eq!(sender.seen(), vec!["signal"]);
    }

    #[test]
    fn test_capture_error_records_source_chain() {
        #[derive(Debug)]
        struct Outer(std::io::Error);

        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "could not load settings")
            }
        }

        impl Error for Outer {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(crate::transport::test_support::RecordingSender::new(
            SendOutcome::Delivered(200),
        ));
        let agent = Agent::with_sender(config(tmp.path(), TransportMode::Disk), recorder).unwrap();
        let error = Outer(std::io::Error::new(std::io::ErrorKind::NotFound, "settings.yaml"));
        agent.capture_error(&error).unwrap();

        let monitor = agent.queue_monitor();
        let recent = monitor.get_recent_events(1);
        let exception = recent[0].event.exception.clone().unwrap();
        assert!(exception.kind.ends_with("Outer"));
        assert_eq!(exception.message, "could not load settings");
        assert_eq!(exception.stacktrace.frames.len(), 1);
        assert_eq!(exception.stacktrace.frames[0].function, "settings.yaml");
        assert_eq!(recent[0].event.level, Level::Error);
    }

    #[test]
    fn test_profile_requires_opt_in() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Sync);
        let samples = vec![RawSample {
            timestamp: 0.01,
            frames: vec![RawFrame {
                file: "/app/main.rs".to_string(),
                line: 3,
                class: None,
                function: Some("main".to_string()),
            }],
        }];
        assert!(agent.capture_profile(samples.clone(), 10.0).is_none());
        assert!(sender.seen().is_empty());

        let sender = Arc::new(RecordingSender::new(SendOutcome::Delivered(200)));
        let agent = Agent::with_sender(
            Config {
                profile: true,
                ..config(tmp.path(), TransportMode::Disk)
            },
            sender,
        )
        .unwrap();
        agent.capture_profile(samples, 10.0).unwrap();
        let event = agent.queue_monitor().get_recent_events(1).remove(0).event;
        assert_eq!(event.kind.as_deref(), Some(PROFILE_EVENT_TYPE));
        assert_eq!(event.duration_ms, Some(10.0));
        assert_eq!(event.profile.unwrap().samples.len(), 1);
    }

    #[test]
    fn test_request_context_is_redacted() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, _) = agent(tmp.path(), TransportMode::Disk);
        agent.capture_event(Payload::message("login failed", Level::Error).with_request(
            RequestInfo {
                url: "https://shop.example.com/login".to_string(),
                method: "POST".to_string(),
                body: Some(r#"{"user":"bob","password":"hunter2"}"#.to_string()),
                ..Default::default()
            },
        ));
        let event = agent.queue_monitor().get_recent_events(1).remove(0).event;
        let data = event.request.unwrap().data.unwrap();
        assert!(data.contains(crate::REDACTED));
        assert!(!data.contains("hunter2"));
    }

    #[test]
    fn test_shutdown_flushes_and_stops_capturing() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Async);
        agent.capture_message("pending", Level::Info);
        assert_eq!(agent.shutdown(), 1);
        assert_eq!(agent.shutdown(), 0);
        assert!(agent.capture_message("late", Level::Info).is_none());
        assert_eq!(sender.seen(), vec!["pending"]);
    }

    #[test]
    fn test_drop_sends_async_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Async);
        agent.capture_message("bye", Level::Info);
        drop(agent);
        assert_eq!(sender.seen(), vec!["bye"]);
    }

    #[test]
    fn test_non_finite_values_survive_the_disk_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, sender) = agent(tmp.path(), TransportMode::Disk);
        agent.add_before_send(|mut event: Event| -> Option<Event> {
            event.measurements.insert("ratio".to_string(), f64::INFINITY);
            Some(event)
        });

        let mut payload = Payload::message("latency spike", Level::Warning);
        payload.measurements.insert("latency".to_string(), f64::NAN);
        payload.measurements.insert("hits".to_string(), 2.0);
        payload.duration_ms = Some(f64::NAN);
        agent.capture_event(payload).unwrap();

        let recent = agent.queue_monitor().get_recent_events(10);
        assert_eq!(recent.len(), 1);
        let measurements = &recent[0].event.measurements;
        assert!(measurements.contains_key("hits"));
        assert!(!measurements.contains_key("latency"));
        assert!(!measurements.contains_key("ratio"));

        let report = agent.flush().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.corrupt, 0);
        assert_eq!(sender.seen(), vec!["latency spike"]);
    }

    #[test]
    fn test_integrations_follow_capture_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let sender = Arc::new(RecordingSender::new(SendOutcome::Delivered(200)));
        let enabled = Arc::new(
            Agent::with_sender(config(tmp.path(), TransportMode::Sync), sender.clone()).unwrap(),
        );
        assert_eq!(enabled.integrations().names(), vec!["panic"]);

        let disabled = Arc::new(
            Agent::with_sender(
                Config {
                    capture_panics: false,
                    ..config(tmp.path(), TransportMode::Sync)
                },
                sender,
            )
            .unwrap(),
        );
        assert!(disabled.integrations().names().is_empty());
    }

    #[test]
    #[serial]
    fn test_init_captures_panics_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = Agent::init(config(tmp.path(), TransportMode::Disk)).unwrap();

        let result = std::panic::catch_unwind(|| panic!("init boom"));
        assert!(result.is_err());

        let recent = agent.queue_monitor().get_recent_events(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event.level, Level::Fatal);
        assert_eq!(recent[0].event.message.as_deref(), Some("init boom"));
    }

    #[test]
    #[serial]
    fn test_init_leaves_panics_alone_when_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = Agent::init(Config {
            capture_panics: false,
            ..config(tmp.path(), TransportMode::Disk)
        })
        .unwrap();

        let result = std::panic::catch_unwind(|| panic!("ignored"));
        assert!(result.is_err());
        assert_eq!(agent.stats().total_files, 0);
    }
}
