// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery strategies.
//!
//! All three strategies share one [`EventSender`] and differ only in when they hand events to
//! it:
//!
//! - [`SyncTransport`] sends on `enqueue`.
//! - [`AsyncTransport`] buffers and sends once when the unit of work finishes.
//! - [`DiskTransport`] always persists; delivery happens on `flush`.
//!
//! Sync and async park transient failures in the disk queue, permanent rejections are dropped.

pub mod deferred;
pub mod disk;
pub mod sync;

use std::io;
use std::sync::Arc;

use tracing::{error, warn};

use crate::config::{Config, TransportMode};
use crate::disk_queue::{DiskQueue, FlushReport, QueueSettings};
use crate::error::AgentError;
use crate::event::Event;
use crate::wire::{EventSender, SendOutcome};

pub use deferred::AsyncTransport;
pub use disk::DiskTransport;
pub use sync::SyncTransport;

/// Sends `event` and parks it in `retry_queue` when the failure is worth retrying.
pub(crate) fn deliver(
    sender: &dyn EventSender,
    retry_queue: Option<&DiskQueue>,
    event: &Event,
) -> SendOutcome {
    let outcome = sender.send(event);
    if let SendOutcome::Transient(reason) = &outcome {
        match retry_queue {
            Some(queue) => {
                if let Err(e) = queue.enqueue(event) {
                    error!(
                        "TRANSPORT | Failed to save event {} to disk queue: {e}",
                        event.event_id()
                    );
                }
            }
            None => warn!(
                "TRANSPORT | Dropping event {} ({reason}): no disk queue available",
                event.event_id()
            ),
        }
    }
    outcome
}

pub enum Transport {
    Sync(SyncTransport),
    Async(AsyncTransport),
    Disk(DiskTransport),
}

impl Transport {
    /// Binds the configured mode to its strategy.
    ///
    /// In disk mode an unusable queue directory is fatal. In sync and async mode it only
    /// costs the retry path, so it is logged and transient failures are dropped.
    pub fn from_config(config: &Config, sender: Arc<dyn EventSender>) -> Result<Self, AgentError> {
        let settings = QueueSettings::from_config(config);
        match config.transport {
            TransportMode::Disk => {
                let queue = Arc::new(DiskQueue::new(settings)?);
                Ok(Transport::Disk(DiskTransport::new(sender, queue)))
            }
            mode => {
                let retry_queue = match DiskQueue::new(settings) {
                    Ok(queue) => Some(Arc::new(queue)),
                    Err(e) => {
                        warn!("TRANSPORT | Retry queue unavailable, transient failures will be dropped: {e}");
                        None
                    }
                };
                Ok(Self::with_queue(mode, sender, retry_queue))
            }
        }
    }

    /// Builds the strategy for `mode` around an existing queue. Disk mode without a queue
    /// degrades to sync without retries.
    #[must_use]
    pub fn with_queue(
        mode: TransportMode,
        sender: Arc<dyn EventSender>,
        queue: Option<Arc<DiskQueue>>,
    ) -> Self {
        match (mode, queue) {
            (TransportMode::Sync, queue) => Transport::Sync(SyncTransport::new(sender, queue)),
            (TransportMode::Async, queue) => Transport::Async(AsyncTransport::new(sender, queue)),
            (TransportMode::Disk, Some(queue)) => Transport::Disk(DiskTransport::new(sender, queue)),
            (TransportMode::Disk, None) => {
                warn!("TRANSPORT | Disk mode requested without a queue, sending synchronously");
                Transport::Sync(SyncTransport::new(sender, None))
            }
        }
    }

    #[must_use]
    pub fn mode(&self) -> TransportMode {
        match self {
            Transport::Sync(_) => TransportMode::Sync,
            Transport::Async(_) => TransportMode::Async,
            Transport::Disk(_) => TransportMode::Disk,
        }
    }

    pub fn enqueue(&self, event: Event) {
        match self {
            Transport::Sync(t) => t.enqueue(event),
            Transport::Async(t) => t.enqueue(event),
            Transport::Disk(t) => t.enqueue(event),
        }
    }

    /// End of the unit of work. Sends the async buffer; a no-op for the other strategies.
    pub fn finish(&self) -> usize {
        match self {
            Transport::Async(t) => t.flush(),
            Transport::Sync(_) | Transport::Disk(_) => 0,
        }
    }

    #[must_use]
    pub fn queue(&self) -> Option<&Arc<DiskQueue>> {
        match self {
            Transport::Sync(t) => t.retry_queue(),
            Transport::Async(t) => t.retry_queue(),
            Transport::Disk(t) => Some(t.queue()),
        }
    }

    /// Delivers whatever sits in the disk queue.
    pub fn flush_queue(&self) -> io::Result<FlushReport> {
        match self {
            Transport::Disk(t) => t.flush(),
            Transport::Sync(_) | Transport::Async(_) => match self.queue() {
                Some(queue) => queue.flush(self.sender().as_ref()),
                None => Ok(FlushReport::default()),
            },
        }
    }

    fn sender(&self) -> &Arc<dyn EventSender> {
        match self {
            Transport::Sync(t) => t.sender(),
            Transport::Async(t) => t.sender(),
            Transport::Disk(t) => t.sender(),
        }
    }
}
