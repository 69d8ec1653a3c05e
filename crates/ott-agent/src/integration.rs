// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks that feed events into an [`Agent`] from outside the producer's own code.
//!
//! Integrations are registered on an [`IntegrationManager`] and do nothing until the host calls
//! [`IntegrationManager::activate_all`].

use std::any::Any;
use std::panic::{self, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::agent::Agent;
use crate::event::{ExceptionBlock, Level, Payload, StackFrame, Stacktrace};

pub trait Integration: Send + Sync {
    fn name(&self) -> &'static str;

    fn activate(&self);
}

#[derive(Default)]
pub struct IntegrationManager {
    integrations: Vec<Box<dyn Integration>>,
}

impl IntegrationManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, integration: impl Integration + 'static) {
        self.integrations.push(Box::new(integration));
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.integrations.iter().map(|i| i.name()).collect()
    }

    pub fn activate_all(&self) {
        for integration in &self.integrations {
            debug!("Activating integration {}", integration.name());
            integration.activate();
        }
    }
}

/// Captures panics as `fatal` events, then hands over to the previously installed hook.
///
/// Holds the agent weakly: once the agent is dropped the hook only delegates.
pub struct PanicIntegration {
    agent: Weak<Agent>,
    activated: AtomicBool,
}

impl PanicIntegration {
    #[must_use]
    pub fn new(agent: &Arc<Agent>) -> Self {
        Self {
            agent: Arc::downgrade(agent),
            activated: AtomicBool::new(false),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn panic_payload(info: &PanicHookInfo<'_>) -> Payload {
    let message = panic_message(info.payload());
    let frames = info
        .location()
        .map(|location| StackFrame {
            filename: location.file().to_string(),
            lineno: Some(location.line()),
            function: crate::UNKNOWN.to_string(),
            module: None,
        })
        .into_iter()
        .collect();

    let mut payload = Payload::exception(ExceptionBlock {
        kind: "panic".to_string(),
        message: message.clone(),
        stacktrace: Stacktrace { frames },
    });
    payload.level = Some(Level::Fatal);
    payload.message = Some(message);
    if let Some(name) = std::thread::current().name() {
        payload
            .extra
            .insert("thread".to_string(), name.to_string().into());
    }
    payload
}

impl Integration for PanicIntegration {
    fn name(&self) -> &'static str {
        "panic"
    }

    fn activate(&self) {
        if self.activated.swap(true, Ordering::SeqCst) {
            return;
        }
        let agent = self.agent.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(agent) = agent.upgrade() {
                agent.capture_event(panic_payload(info));
                agent.finish_unit_of_work();
            }
            previous(info);
        }));
    }
}
