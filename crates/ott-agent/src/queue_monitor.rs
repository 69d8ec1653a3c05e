// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of the disk queue for dashboards and the CLI. Nothing here takes part in
//! delivery decisions, except [`QueueMonitor::flush`] which hands over to the queue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::disk_queue::{DiskQueue, QueueSettings};
use crate::event::Event;
use crate::wire::EventSender;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueStats {
    pub exists: bool,
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub size_mb: f64,
    pub oldest_ts: Option<DateTime<Utc>>,
    pub newest_ts: Option<DateTime<Utc>>,
    pub is_full: bool,
    pub max_size_mb: f64,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecentEvent {
    pub file: String,
    pub size: u64,
    pub modified_ts: DateTime<Utc>,
    pub event: Event,
}

#[allow(clippy::cast_precision_loss)]
fn to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time.max(UNIX_EPOCH))
}

pub struct QueueMonitor {
    queue: DiskQueue,
    sender: Option<Arc<dyn EventSender>>,
}

impl QueueMonitor {
    /// A monitor over the queue described by `settings`. Without a sender, `flush` reports
    /// failure.
    #[must_use]
    pub fn new(settings: QueueSettings, sender: Option<Arc<dyn EventSender>>) -> Self {
        Self {
            queue: DiskQueue::open(settings),
            sender,
        }
    }

    #[must_use]
    pub fn get_stats(&self) -> QueueStats {
        let settings = self.queue.settings();
        let mut stats = QueueStats {
            exists: settings.dir.is_dir(),
            total_files: 0,
            total_size_bytes: 0,
            size_mb: 0.0,
            oldest_ts: None,
            newest_ts: None,
            is_full: false,
            max_size_mb: to_mb(settings.max_size),
            errors: Vec::new(),
        };
        if !stats.exists {
            stats.errors.push("Directory does not exist".to_string());
            return stats;
        }

        let items = match self.queue.list() {
            Ok(items) => items,
            Err(e) => {
                stats.errors.push(format!("Cannot read directory: {e}"));
                return stats;
            }
        };

        let now = SystemTime::now();
        for item in &items {
            stats.total_size_bytes += item.total_size();
            let modified = to_utc(item.modified);
            stats.oldest_ts = Some(stats.oldest_ts.map_or(modified, |t| t.min(modified)));
            stats.newest_ts = Some(stats.newest_ts.map_or(modified, |t| t.max(modified)));

            let age = now.duration_since(item.modified).unwrap_or_default();
            if age > settings.max_age {
                stats.errors.push(format!("{} is too old", item.name));
            }
        }
        stats.total_files = items.len();
        stats.size_mb = to_mb(stats.total_size_bytes);
        stats.is_full = stats.total_size_bytes >= settings.max_size;
        stats
    }

    /// Up to `limit` decodable items, newest first. Items that fail to decode are skipped.
    #[must_use]
    pub fn get_recent_events(&self, limit: usize) -> Vec<RecentEvent> {
        let mut items = match self.queue.list() {
            Ok(items) => items,
            Err(e) => {
                debug!("QUEUE | Cannot list {}: {e}", self.queue.dir().display());
                return Vec::new();
            }
        };
        items.reverse();

        items
            .into_iter()
            .filter_map(|item| match self.queue.read_event(&item) {
                Ok(event) => Some(RecentEvent {
                    size: item.size,
                    modified_ts: to_utc(item.modified),
                    file: item.name,
                    event,
                }),
                Err(e) => {
                    debug!("QUEUE | Skipping {}: {e}", item.name);
                    None
                }
            })
            .take(limit)
            .collect()
    }

    /// Runs a delivery pass over the queue. Returns `false` when no sender is attached or the
    /// directory cannot be read.
    pub fn flush(&self) -> bool {
        let Some(sender) = &self.sender else {
            error!("QUEUE | Queue flush failed: no sender configured");
            return false;
        };
        match self.queue.flush(sender.as_ref()) {
            Ok(_) => true,
            Err(e) => {
                error!("QUEUE | Queue flush failed: {e}");
                false
            }
        }
    }

    /// Purges expired items, returning how many were removed.
    pub fn gc(&self) -> std::io::Result<usize> {
        self.queue.gc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;
    use crate::wire::SendOutcome;
    use std::fs::{self, File};
    use std::path::Path;
    use std::time::Duration;

    struct AlwaysOk;

    impl EventSender for AlwaysOk {
        fn send(&self, _event: &Event) -> SendOutcome {
            SendOutcome::Delivered(200)
        }
    }

    fn settings(dir: &Path) -> QueueSettings {
        QueueSettings {
            dir: dir.to_path_buf(),
            max_age: Duration::from_secs(3600),
            max_size: 2 * 1024 * 1024,
            compression_level: 6,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    fn enqueue(dir: &Path, text: &str) -> std::path::PathBuf {
        let mut event = Event::new(Level::Error);
        event.message = Some(text.to_string());
        DiskQueue::new(settings(dir)).unwrap().enqueue(&event).unwrap()
    }

    #[test]
    fn test_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = QueueMonitor::new(settings(&tmp.path().join("absent")), None);
        let stats = monitor.get_stats();
        assert!(!stats.exists);
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.errors, vec!["Directory does not exist"]);
        assert!((stats.max_size_mb - 2.0).abs() < f64::EPSILON);
        assert!(monitor.get_recent_events(10).is_empty());
    }

    #[test]
    fn test_stats_over_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let old = enqueue(tmp.path(), "old");
        enqueue(tmp.path(), "new");
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        let stats = QueueMonitor::new(settings(tmp.path()), None).get_stats();
        assert!(stats.exists);
        assert_eq!(stats.total_files, 2);
        assert!(stats.total_size_bytes > 0);
        assert!(!stats.is_full);
        assert!(stats.oldest_ts < stats.newest_ts);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].ends_with(" is too old"));
    }

    #[test]
    fn test_is_full_at_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let path = enqueue(tmp.path(), "x");
        let size = fs::metadata(path).unwrap().len();
        let stats = QueueMonitor::new(
            QueueSettings {
                max_size: size,
                ..settings(tmp.path())
            },
            None,
        )
        .get_stats();
        assert!(stats.is_full);
    }

    #[test]
    fn test_recent_events_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, text) in [
            ("event_20240101_000001_1000.json.raw", "first"),
            ("event_20240101_000002_1000.json.raw", "second"),
            ("event_20240101_000003_1000.json.raw", "third"),
        ] {
            let mut event = Event::new(Level::Info);
            event.message = Some(text.to_string());
            fs::write(tmp.path().join(name), serde_json::to_vec(&event).unwrap()).unwrap();
        }
        fs::write(tmp.path().join("event_20240101_000004_1000.json.raw"), "{broken").unwrap();

        let recent = QueueMonitor::new(settings(tmp.path()), None).get_recent_events(2);
        let messages: Vec<_> = recent
            .iter()
            .map(|r| r.event.message.as_deref().unwrap())
            .collect();
        assert_eq!(messages, vec!["third", "second"]);
        assert_eq!(recent[0].file, "event_20240101_000003_1000.json.raw");
    }

    #[test]
    fn test_flush_requires_sender() {
        let tmp = tempfile::tempdir().unwrap();
        enqueue(tmp.path(), "pending");
        assert!(!QueueMonitor::new(settings(tmp.path()), None).flush());

        let monitor = QueueMonitor::new(settings(tmp.path()), Some(Arc::new(AlwaysOk)));
        assert!(monitor.flush());
        assert_eq!(monitor.get_stats().total_files, 0);
    }
}
