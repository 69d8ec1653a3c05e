// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use tracing::error;

use crate::disk_queue::{DiskQueue, FlushReport};
use crate::event::Event;
use crate::wire::EventSender;

/// Persists every event without a network attempt. Delivery happens on [`DiskTransport::flush`].
pub struct DiskTransport {
    sender: Arc<dyn EventSender>,
    queue: Arc<DiskQueue>,
}

impl DiskTransport {
    #[must_use]
    pub fn new(sender: Arc<dyn EventSender>, queue: Arc<DiskQueue>) -> Self {
        Self { sender, queue }
    }

    pub fn enqueue(&self, event: Event) {
        if let Err(e) = self.queue.enqueue(&event) {
            error!(
                "TRANSPORT | Failed to save event {} to disk queue: {e}",
                event.event_id()
            );
        }
    }

    pub fn flush(&self) -> io::Result<FlushReport> {
        self.queue.flush(self.sender.as_ref())
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<DiskQueue> {
        &self.queue
    }

    pub(crate) fn sender(&self) -> &Arc<dyn EventSender> {
        &self.sender
    }
}
