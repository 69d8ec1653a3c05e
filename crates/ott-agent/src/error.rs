// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors that prevent the agent from being constructed.
///
/// Delivery faults never show up here: they are folded into
/// [`crate::wire::SendOutcome`] and [`crate::disk_queue::FlushReport`].
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue directory {path} is unusable: {reason}")]
    QueueDirectory { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::config::ConfigError> for AgentError {
    fn from(err: crate::config::ConfigError) -> Self {
        AgentError::InvalidConfig(err.to_string())
    }
}
