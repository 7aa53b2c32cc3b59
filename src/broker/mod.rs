//! Local file-backed command transport
//!
//! A broker without a daemon: publishers append newline-delimited JSON
//! records to a shared log file and flush before returning; subscribers in
//! other processes tail the file with a private byte offset. Subscribers in
//! the same process may additionally register a queue for synchronous
//! fast-path delivery. The two mechanisms are independent, so a message can
//! arrive twice and consumers must tolerate re-application.
//!
//! Delivery semantics: at-least-once per tail cycle, ordered within the
//! file, no guarantee under queue pressure (see [`queue::MessageQueue`]).

mod queue;

pub use queue::MessageQueue;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// One record in the broker log, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Arbitrary JSON payload
    pub payload: serde_json::Value,
    /// Publish time
    pub timestamp: DateTime<Utc>,
}

/// Where a tailer starts reading the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFrom {
    /// Replay the whole log from offset 0
    Start,
    /// Only messages appended after the tailer starts
    End,
}

struct Shared {
    log_path: PathBuf,
    poll_interval: Duration,
    subscribers: Mutex<HashMap<String, Vec<MessageQueue<BrokerMessage>>>>,
}

/// File-backed publish/subscribe transport
///
/// Cheap to clone; clones share the same log and subscriber registry.
/// Construct one per process and inject it where needed.
#[derive(Clone)]
pub struct FileBroker {
    shared: Arc<Shared>,
}

impl FileBroker {
    /// Open a broker over the given log file, creating it if missing
    ///
    /// # Errors
    ///
    /// Returns error if the log file (or its parent directory) cannot be
    /// created.
    pub fn open(log_path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        tracing::debug!(path = %log_path.display(), "broker log opened");

        Ok(Self {
            shared: Arc::new(Shared {
                log_path: log_path.to_path_buf(),
                poll_interval,
                subscribers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Path of the shared log file
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.shared.log_path
    }

    /// Append one message to the log and flush it before returning
    ///
    /// After the record is durable, the message is also handed to any
    /// same-process subscriber queues for the topic (best-effort, never
    /// blocking, no durability implied).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the record could not be written and
    /// flushed. The caller must not assume delivery in that case.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        let line = serde_json::to_string(&message)?;
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.shared.log_path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()
        };
        write().map_err(|e| {
            Error::Transport(format!(
                "append to {} failed: {e}",
                self.shared.log_path.display()
            ))
        })?;

        tracing::debug!(topic, "message published");

        // Same-process fast path
        let subscribers = self
            .shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned");
        if let Some(queues) = subscribers.get(topic) {
            for queue in queues {
                queue.push_latest(message.clone());
            }
        }

        Ok(())
    }

    /// Register a queue for same-process fast-path delivery on `topic`
    ///
    /// Optional: cross-process subscribers rely solely on [`Self::tail`].
    pub fn subscribe(&self, topic: &str, queue: MessageQueue<BrokerMessage>) {
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(queue);
        tracing::debug!(topic, "fast-path subscriber registered");
    }

    /// Spawn a background tailer delivering matching messages into `queue`
    ///
    /// The tailer keeps a private byte offset that only moves forward,
    /// except when the log shrinks (rotation/reset), in which case it
    /// self-heals by restarting from offset 0. Malformed lines are skipped.
    /// Abort the returned handle to stop tailing; no file handle is held
    /// between poll cycles.
    pub fn tail(
        &self,
        topics: Vec<String>,
        queue: MessageQueue<BrokerMessage>,
        from: TailFrom,
    ) -> JoinHandle<()> {
        let path = self.shared.log_path.clone();
        let poll_interval = self.shared.poll_interval;

        tokio::spawn(async move {
            let mut offset: u64 = match from {
                TailFrom::Start => 0,
                TailFrom::End => fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            };
            tracing::debug!(path = %path.display(), offset, topics = ?topics, "tailer started");

            loop {
                match poll_log(&path, offset, &topics, &queue) {
                    Ok(new_offset) => offset = new_offset,
                    Err(e) => {
                        tracing::warn!(error = %e, path = %path.display(), "tail poll failed");
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

/// One tail poll cycle: deliver new matching lines and return the new offset
fn poll_log(
    path: &Path,
    mut offset: u64,
    topics: &[String],
    queue: &MessageQueue<BrokerMessage>,
) -> Result<u64> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        // A missing log is not fatal; a publisher will recreate it
        Err(_) => return Ok(offset),
    };

    if size < offset {
        tracing::warn!(
            path = %path.display(),
            offset,
            size,
            "log shrank, restarting from the beginning"
        );
        offset = 0;
    }

    if size == offset {
        return Ok(offset);
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    for line in buf.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<BrokerMessage>(line) {
            Ok(message) => {
                if topics.iter().any(|t| t == &message.topic) {
                    queue.push_latest(message);
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, "skipping malformed broker line");
            }
        }
    }

    Ok(offset + buf.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_appends_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let broker = FileBroker::open(&path, Duration::from_millis(50)).unwrap();

        broker
            .publish("cmd", serde_json::json!({"action": "开"}))
            .unwrap();
        broker
            .publish("cmd", serde_json::json!({"action": "关"}))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: BrokerMessage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.topic, "cmd");
        assert_eq!(first.payload["action"], "开");
    }

    #[test]
    fn fast_path_delivers_to_matching_topic_only() {
        let dir = tempfile::tempdir().unwrap();
        let broker =
            FileBroker::open(&dir.path().join("log.jsonl"), Duration::from_millis(50)).unwrap();

        let queue = MessageQueue::bounded(4);
        broker.subscribe("cmd", queue.clone());

        broker.publish("cmd", serde_json::json!(1)).unwrap();
        broker.publish("other", serde_json::json!(2)).unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_recv().unwrap().payload, serde_json::json!(1));
    }

    #[test]
    fn poll_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let broker = FileBroker::open(&path, Duration::from_millis(50)).unwrap();

        broker.publish("cmd", serde_json::json!(1)).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "not json at all").unwrap();
        }
        broker.publish("cmd", serde_json::json!(2)).unwrap();

        let queue = MessageQueue::bounded(8);
        let offset = poll_log(&path, 0, &["cmd".to_string()], &queue).unwrap();

        assert_eq!(offset, fs::metadata(&path).unwrap().len());
        assert_eq!(queue.try_recv().unwrap().payload, serde_json::json!(1));
        assert_eq!(queue.try_recv().unwrap().payload, serde_json::json!(2));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn poll_resets_offset_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let broker = FileBroker::open(&path, Duration::from_millis(50)).unwrap();

        broker.publish("cmd", serde_json::json!("old")).unwrap();
        let queue = MessageQueue::bounded(8);
        let offset = poll_log(&path, 0, &["cmd".to_string()], &queue).unwrap();
        assert!(offset > 0);
        queue.try_recv().unwrap();

        // Simulate rotation: truncate, then publish something shorter
        fs::write(&path, b"").unwrap();
        broker.publish("cmd", serde_json::json!("new")).unwrap();

        let offset = poll_log(&path, offset, &["cmd".to_string()], &queue).unwrap();
        assert_eq!(offset, fs::metadata(&path).unwrap().len());
        assert_eq!(
            queue.try_recv().unwrap().payload,
            serde_json::json!("new")
        );
    }
}
