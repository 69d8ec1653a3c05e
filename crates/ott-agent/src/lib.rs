// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # ott-agent
//!
//! A telemetry agent that captures error, message and profile events from an
//! instrumented process and delivers them to a remote ingestion endpoint.
//!
//! ## Pipeline
//!
//! ```text
//!   producer ──> FilterChain ──> Transport ──> WireSender ──> intake
//!                                   │               │
//!                                   │      transient failure
//!                                   v               v
//!                               DiskQueue <─────────┘
//!                                   │
//!                           flush (manual / periodic)
//! ```
//!
//! - [`filter`]: ordered, short-circuiting before-send policies
//! - [`transport`]: sync, deferred (async) and disk delivery strategies
//! - [`wire`]: hand-framed HTTP/1.1 sender with outcome classification
//! - [`disk_queue`]: durable, size and age bounded retry queue
//! - [`profile`]: call-stack sample compaction
//! - [`agent`]: the explicitly owned context value producers talk to
//! - [`layer`]: forwards the host's `tracing` events into the agent

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod disk_queue;
pub mod error;
pub mod event;
pub mod filter;
pub mod integration;
pub mod layer;
pub mod logger;
pub mod proc;
pub mod profile;
pub mod queue_monitor;
pub mod transport;
pub mod wire;

/// Marker written in place of values that must not leave the process.
pub const FILTERED: &str = "[filtered]";
/// Replacement for redacted request body fields.
pub const REDACTED: &str = "[REDACTED]";
pub const UNKNOWN: &str = "<unknown>";

pub const SDK_NAME: &str = "ott-agent-rust";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
