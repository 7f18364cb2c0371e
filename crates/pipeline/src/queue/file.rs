//! Directory-backed queue backend.
//!
//! Layout under the broker root:
//!
//! ```text
//! <root>/<queue>/<seq>.msg            pending payloads, FIFO by name
//! <root>/<queue>/.inflight/<seq>.msg  the payload currently in flight
//! <root>/<queue>/.tmp/                writes in progress
//! ```
//!
//! A push writes and syncs a temp file, then renames it into the queue
//! directory. A pop renames the oldest pending file into `.inflight`, so a
//! crash between pop and acknowledge leaves the payload there for the next
//! session. File names sort by push time: zero-padded nanoseconds since the
//! epoch, a per-process counter and a random suffix.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{Queue, validate_queue_name};
use crate::error::QueueError;

const BACKEND: &str = "file";
const IN_FLIGHT_DIR: &str = ".inflight";
const TMP_DIR: &str = ".tmp";
const EXTENSION: &str = "msg";

/// Queues stored as files in one directory per queue.
pub struct FileBroker {
    root: PathBuf,
    poll_interval: Duration,
    sequence: AtomicU64,
    /// Queues whose in-flight payload this broker has handed out.
    delivered: Mutex<HashSet<String>>,
}

impl FileBroker {
    /// Opens (and creates) the broker root.
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, QueueError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "file broker opened");
        Ok(Self {
            root,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            sequence: AtomicU64::new(0),
            delivered: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf, QueueError> {
        validate_queue_name(queue)?;
        let dir = self.root.join(queue);
        fs::create_dir_all(dir.join(IN_FLIGHT_DIR))?;
        fs::create_dir_all(dir.join(TMP_DIR))?;
        Ok(dir)
    }

    fn delivered(&self) -> MutexGuard<'_, HashSet<String>> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_name(&self) -> String {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple();
        format!("{nanos:020}-{seq:010}-{suffix}.{EXTENSION}")
    }

    /// Payload files in `dir`, sorted by name.
    fn list(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// One non-blocking pop attempt.
    fn try_take(&self, queue: &str) -> Result<Option<Bytes>, QueueError> {
        let dir = self.queue_dir(queue)?;
        let in_flight_dir = dir.join(IN_FLIGHT_DIR);
        let mut delivered = self.delivered();

        if let Some(current) = Self::list(&in_flight_dir)?.into_iter().next() {
            if delivered.contains(queue) {
                return Ok(None);
            }
            let payload = fs::read(&current)?;
            delivered.insert(queue.to_owned());
            tracing::info!(queue, "redelivering in-flight message");
            return Ok(Some(Bytes::from(payload)));
        }

        for pending in Self::list(&dir)? {
            let Some(name) = pending.file_name() else {
                continue;
            };
            let target = in_flight_dir.join(name);
            match fs::rename(&pending, &target) {
                Ok(()) => {
                    let payload = fs::read(&target)?;
                    delivered.insert(queue.to_owned());
                    return Ok(Some(Bytes::from(payload)));
                }
                // taken by another consumer between listing and rename
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }
}

impl Queue for FileBroker {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let dir = self.queue_dir(queue)?;
        let name = self.next_name();
        let tmp = dir.join(TMP_DIR).join(&name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(&name))?;
        // the rename is durable only once the directory entry is
        File::open(&dir)?.sync_all()?;
        Ok(())
    }

    fn pop_blocking(&self, queue: &str) -> Result<Bytes, QueueError> {
        loop {
            if let Some(payload) = self.try_take(queue)? {
                return Ok(payload);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn pop_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_take(queue)? {
                return Ok(Some(payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn acknowledge(&self, queue: &str) -> Result<(), QueueError> {
        let dir = self.queue_dir(queue)?;
        let mut delivered = self.delivered();
        let files = Self::list(&dir.join(IN_FLIGHT_DIR))?;
        if files.is_empty() {
            return Err(QueueError::NothingInFlight(queue.to_owned()));
        }
        for file in files {
            fs::remove_file(file)?;
        }
        delivered.remove(queue);
        Ok(())
    }

    fn release(&self, queue: &str) -> Result<(), QueueError> {
        validate_queue_name(queue)?;
        self.delivered().remove(queue);
        Ok(())
    }

    fn in_flight(&self, queue: &str) -> Result<Option<Bytes>, QueueError> {
        let dir = self.queue_dir(queue)?;
        match Self::list(&dir.join(IN_FLIGHT_DIR))?.into_iter().next() {
            Some(path) => Ok(Some(Bytes::from(fs::read(path)?))),
            None => Ok(None),
        }
    }

    fn length(&self, queue: &str) -> Result<usize, QueueError> {
        let dir = self.queue_dir(queue)?;
        Ok(Self::list(&dir)?.len())
    }

    fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let dir = self.queue_dir(queue)?;
        let mut delivered = self.delivered();
        for file in Self::list(&dir)?
            .into_iter()
            .chain(Self::list(&dir.join(IN_FLIGHT_DIR))?)
        {
            fs::remove_file(file)?;
        }
        delivered.remove(queue);
        tracing::info!(queue, "queue cleared");
        Ok(())
    }
}
