// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable store for events that could not be delivered yet.
//!
//! Each event lives in its own file named `event_<YYYYMMDD>_<HHMMSS>_<NNNN>.json.gz` (or
//! `.json.raw` when uncompressed). The name sorts by creation time and that order is used for
//! both eviction and delivery; directory enumeration order is never relied upon. A sidecar
//! `<file>.attempt` holds the number of failed delivery attempts.
//!
//! Several processes may share the directory. There is no locking: the byte budget is
//! best-effort under concurrency and a queued event may be delivered more than once.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::event::Event;
use crate::wire::{self, ContentEncoding, EventSender, SendOutcome};

pub const FILE_PREFIX: &str = "event_";
pub const GZ_EXTENSION: &str = ".json.gz";
pub const RAW_EXTENSION: &str = ".json.raw";
pub const ATTEMPT_SUFFIX: &str = ".attempt";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of the timestamp embedded in new filenames.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueSettings {
    pub dir: PathBuf,
    pub max_age: Duration,
    /// Byte budget for payloads plus sidecars.
    pub max_size: u64,
    /// Gzip level, 0 writes `.json.raw` files.
    pub compression_level: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl QueueSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.disk_queue_dir.clone(),
            max_age: config.queue_max_age_duration(),
            max_size: config.queue_max_size,
            compression_level: config.compressed,
            backoff_base: Duration::from_millis(config.queue_backoff_base_ms),
            backoff_max: Duration::from_millis(config.queue_backoff_max_ms),
        }
    }
}

/// One queued payload as found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedItem {
    pub path: PathBuf,
    pub name: String,
    /// Payload bytes.
    pub size: u64,
    /// Sidecar bytes, 0 when there is none.
    pub sidecar_size: u64,
    pub modified: SystemTime,
    pub attempts: u32,
}

impl QueuedItem {
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.name.ends_with(GZ_EXTENSION)
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.size + self.sidecar_size
    }

    #[must_use]
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_path(&self.path)
    }
}

/// Counters for one `flush` pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub delivered: usize,
    pub rejected: usize,
    /// Transient failures, left queued with their attempt count bumped.
    pub retained: usize,
    /// Unreadable items, deleted.
    pub corrupt: usize,
    /// Items purged by age before sending.
    pub expired: usize,
}

pub struct DiskQueue {
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl DiskQueue {
    /// Creates the directory when missing and checks that it is writable.
    pub fn new(settings: QueueSettings) -> Result<Self, AgentError> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: QueueSettings, clock: Arc<dyn Clock>) -> Result<Self, AgentError> {
        ensure_writable(&settings.dir)?;
        Ok(Self { settings, clock })
    }

    /// Opens an existing queue without creating or probing the directory. Used by readers.
    #[must_use]
    pub fn open(settings: QueueSettings) -> Self {
        Self {
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    /// Queued items, oldest first.
    pub fn list(&self) -> io::Result<Vec<QueuedItem>> {
        let mut payloads = Vec::new();
        for entry in fs::read_dir(&self.settings.dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_payload_name(&name) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                // Deleted by a concurrent flusher between read_dir and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let path = entry.path();
            let sidecar = sidecar_path(&path);
            payloads.push(QueuedItem {
                sidecar_size: fs::metadata(&sidecar).map(|m| m.len()).unwrap_or(0),
                attempts: read_attempts(&sidecar),
                size: metadata.len(),
                modified: metadata.modified()?,
                name,
                path,
            });
        }
        payloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(payloads)
    }

    /// Bytes currently used by payloads and sidecars.
    pub fn total_size(&self) -> io::Result<u64> {
        Ok(self.list()?.iter().map(QueuedItem::total_size).sum())
    }

    /// Deletes items older than the configured max age, and sidecars whose payload is gone.
    /// Returns how many items were purged.
    pub fn gc(&self) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut purged = 0;
        for item in self.list()? {
            let age = now.duration_since(item.modified).unwrap_or_default();
            if age > self.settings.max_age {
                debug!("QUEUE | Purging {} (age {}s)", item.name, age.as_secs());
                remove_item(&item.path);
                purged += 1;
            }
        }
        self.remove_orphan_sidecars()?;
        if purged > 0 {
            info!("QUEUE | Purged {purged} expired item(s)");
        }
        Ok(purged)
    }

    fn remove_orphan_sidecars(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.settings.dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(payload) = name.strip_suffix(ATTEMPT_SUFFIX) else {
                continue;
            };
            if is_payload_name(payload) && !self.settings.dir.join(payload).exists() {
                remove_quietly(&entry.path());
            }
        }
        Ok(())
    }

    /// Persists `event`. Expired items are purged first and, when the new payload would push
    /// the queue over budget, the oldest items are evicted until it fits.
    pub fn enqueue(&self, event: &Event) -> Result<PathBuf, QueueError> {
        if let Err(e) = self.gc() {
            warn!("QUEUE | Garbage collection failed: {e}");
        }

        let json = serde_json::to_vec(event)?;
        let (body, encoding) = wire::compress(json, self.settings.compression_level);

        self.make_room(body.len() as u64)?;

        let extension = match encoding {
            ContentEncoding::Gzip => GZ_EXTENSION,
            ContentEncoding::Identity => RAW_EXTENSION,
        };
        let path = self.write_new(&body, extension)?;
        debug!(
            "QUEUE | Queued event {} as {}",
            event.event_id(),
            path.display()
        );
        Ok(path)
    }

    fn make_room(&self, incoming: u64) -> io::Result<()> {
        let budget = self.settings.max_size;
        let items = self.list()?;
        let mut total: u64 = items.iter().map(QueuedItem::total_size).sum();

        let mut evicted = 0;
        for item in &items {
            if total + incoming <= budget {
                break;
            }
            warn!("QUEUE | Evicting {} to stay under budget", item.name);
            remove_item(&item.path);
            total = total.saturating_sub(item.total_size());
            evicted += 1;
        }

        if evicted > 0 {
            info!("QUEUE | Evicted {evicted} item(s), {total} bytes remain");
        }
        if incoming > budget {
            warn!("QUEUE | Event of {incoming} bytes exceeds the {budget} byte budget on its own");
        }
        Ok(())
    }

    fn write_new(&self, body: &[u8], extension: &str) -> io::Result<PathBuf> {
        let stamp = self.clock.now().format("%Y%m%d_%H%M%S");
        loop {
            let name = format!(
                "{FILE_PREFIX}{stamp}_{}{extension}",
                fastrand::u32(1000..=9999)
            );
            let path = self.settings.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write_or_discard(&path, &mut file, body)?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads and decodes a queued item.
    pub fn read_event(&self, item: &QueuedItem) -> Result<Event, QueueError> {
        read_event(&item.path)
    }

    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = u64::try_from(self.settings.backoff_base.as_millis()).unwrap_or(u64::MAX);
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base.saturating_mul(factor));
        delay.min(self.settings.backoff_max)
    }

    /// Attempts delivery of every queued item, oldest first.
    pub fn flush(&self, sender: &dyn EventSender) -> io::Result<FlushReport> {
        let mut report = FlushReport {
            expired: self.gc()?,
            ..Default::default()
        };

        let items = self.list()?;
        if items.is_empty() {
            return Ok(report);
        }
        debug!("QUEUE | Flushing {} item(s)", items.len());

        for item in items {
            let delay = self.backoff_delay(item.attempts);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            let event = match self.read_event(&item) {
                Ok(event) => event,
                Err(QueueError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("QUEUE | {} vanished before delivery", item.name);
                    continue;
                }
                Err(e) => {
                    error!("QUEUE | Deleting corrupt item {}: {e}", item.name);
                    remove_item(&item.path);
                    report.corrupt += 1;
                    continue;
                }
            };

            match sender.send(&event) {
                SendOutcome::Delivered(_) => {
                    remove_item(&item.path);
                    report.delivered += 1;
                }
                SendOutcome::Rejected(reason) => {
                    warn!("QUEUE | Dropping {} after rejection: {reason}", item.name);
                    remove_item(&item.path);
                    report.rejected += 1;
                }
                SendOutcome::Transient(reason) => {
                    let attempts = item.attempts.saturating_add(1);
                    debug!("QUEUE | {} attempt {attempts} failed: {reason}", item.name);
                    if let Err(e) = fs::write(item.sidecar_path(), attempts.to_string()) {
                        error!("QUEUE | Could not record attempt for {}: {e}", item.name);
                    }
                    report.retained += 1;
                }
            }
        }

        info!(
            "QUEUE | Flush done: delivered={} rejected={} retained={} corrupt={} expired={}",
            report.delivered, report.rejected, report.retained, report.corrupt, report.expired
        );
        Ok(report)
    }
}

/// Writes `body`, deleting `path` when the write fails so a truncated payload never lingers.
fn write_or_discard(path: &Path, writer: &mut impl Write, body: &[u8]) -> io::Result<()> {
    writer.write_all(body).map_err(|e| {
        error!("QUEUE | Write to {} failed, removing it: {e}", path.display());
        if let Err(remove_err) = fs::remove_file(path) {
            warn!("QUEUE | Could not remove {}: {remove_err}", path.display());
        }
        e
    })
}

/// Decodes the payload at `path`, ungzipping `.json.gz` files.
pub fn read_event(path: &Path) -> Result<Event, QueueError> {
    let content = fs::read(path)?;
    let is_gzip = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(GZ_EXTENSION));
    let json = if is_gzip {
        let mut decoded = Vec::new();
        GzDecoder::new(&content[..]).read_to_end(&mut decoded)?;
        decoded
    } else {
        content
    };
    Ok(serde_json::from_slice(&json)?)
}

fn is_payload_name(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && (name.ends_with(GZ_EXTENSION) || name.ends_with(RAW_EXTENSION))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(ATTEMPT_SUFFIX);
    PathBuf::from(sidecar)
}

fn read_attempts(sidecar: &Path) -> u32 {
    fs::read_to_string(sidecar)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("QUEUE | Could not delete {}: {e}", path.display());
        }
    }
}

/// Deletes a payload together with its sidecar.
fn remove_item(path: &Path) {
    remove_quietly(path);
    remove_quietly(&sidecar_path(path));
}

fn ensure_writable(dir: &Path) -> Result<(), AgentError> {
    let fault = |reason: String| AgentError::QueueDirectory {
        path: dir.to_path_buf(),
        reason,
    };

    fs::create_dir_all(dir).map_err(|e| fault(format!("cannot create directory: {e}")))?;
    if !dir.is_dir() {
        return Err(fault("not a directory".to_string()));
    }

    let marker = dir.join(format!(".write_check_{}", fastrand::u32(..)));
    File::create(&marker).map_err(|e| fault(format!("not writable: {e}")))?;
    remove_quietly(&marker);
    Ok(())
}
