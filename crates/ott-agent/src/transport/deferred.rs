// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deferred delivery: events are buffered in memory and sent once, when the host signals the
//! end of the unit of work.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::disk_queue::DiskQueue;
use crate::event::Event;
use crate::transport::deliver;
use crate::wire::EventSender;

/// Called once before the first batch is sent, so the host can release its response to the
/// caller and delivery adds no latency to it.
pub type ResponseRelease = Box<dyn FnOnce() + Send>;

pub struct AsyncTransport {
    sender: Arc<dyn EventSender>,
    retry_queue: Option<Arc<DiskQueue>>,
    buffer: Mutex<Vec<Event>>,
    response_release: Mutex<Option<ResponseRelease>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AsyncTransport {
    #[must_use]
    pub fn new(sender: Arc<dyn EventSender>, retry_queue: Option<Arc<DiskQueue>>) -> Self {
        Self {
            sender,
            retry_queue,
            buffer: Mutex::new(Vec::new()),
            response_release: Mutex::new(None),
        }
    }

    pub fn set_response_release(&self, release: ResponseRelease) {
        *lock(&self.response_release) = Some(release);
    }

    pub fn enqueue(&self, event: Event) {
        let mut buffer = lock(&self.buffer);
        if buffer.is_empty() {
            debug!("TRANSPORT | New batch started, delivery deferred to end of unit of work");
        }
        buffer.push(event);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Sends the current batch and returns how many events it held.
    ///
    /// The batch is detached before sending, so a second call sends nothing and events
    /// enqueued meanwhile form the next batch.
    pub fn flush(&self) -> usize {
        let batch = mem::take(&mut *lock(&self.buffer));
        if batch.is_empty() {
            return 0;
        }

        if let Some(release) = lock(&self.response_release).take() {
            release();
        }

        debug!("TRANSPORT | Sending batch of {} event(s)", batch.len());
        for event in &batch {
            deliver(self.sender.as_ref(), self.retry_queue.as_deref(), event);
        }
        batch.len()
    }

    #[must_use]
    pub fn retry_queue(&self) -> Option<&Arc<DiskQueue>> {
        self.retry_queue.as_ref()
    }

    pub(crate) fn sender(&self) -> &Arc<dyn EventSender> {
        &self.sender
    }
}

impl Drop for AsyncTransport {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            debug!("TRANSPORT | Sending {pending} buffered event(s) on shutdown");
            self.flush();
        }
    }
}
