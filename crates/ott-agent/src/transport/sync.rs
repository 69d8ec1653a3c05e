// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::disk_queue::DiskQueue;
use crate::event::Event;
use crate::transport::deliver;
use crate::wire::EventSender;

/// Sends every event as soon as it is enqueued.
pub struct SyncTransport {
    sender: Arc<dyn EventSender>,
    retry_queue: Option<Arc<DiskQueue>>,
}

impl SyncTransport {
    #[must_use]
    pub fn new(sender: Arc<dyn EventSender>, retry_queue: Option<Arc<DiskQueue>>) -> Self {
        Self {
            sender,
            retry_queue,
        }
    }

    pub fn enqueue(&self, event: Event) {
        deliver(self.sender.as_ref(), self.retry_queue.as_deref(), &event);
    }

    #[must_use]
    pub fn retry_queue(&self) -> Option<&Arc<DiskQueue>> {
        self.retry_queue.as_ref()
    }

    pub(crate) fn sender(&self) -> &Arc<dyn EventSender> {
        &self.sender
    }
}
