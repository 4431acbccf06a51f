pub mod record;

use std::collections::VecDeque;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::record::Record;

/// Queued records beyond this evict the oldest.
const QUEUE_CAPACITY: usize = 1000;

/// Append-only destination for serialized records.
enum LogWriter {
    File(File),
    Stdout(io::Stdout),
}

impl LogWriter {
    /// Write one record line and flush it to the OS.
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Self::File(file) => {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
                file.flush()
            }
            Self::Stdout(stdout) => {
                let mut lock = stdout.lock();
                lock.write_all(line.as_bytes())?;
                lock.write_all(b"\n")?;
                lock.flush()
            }
        }
    }
}

/// Asynchronous JSON-lines sink.
///
/// Producers enqueue without blocking; a single consumer task serializes
/// records to the writer. `emit_sync` bypasses the queue for records that
/// must hit the stream before the process exits.
pub struct LogSink {
    queue: Mutex<VecDeque<Record>>,
    notify: Notify,
    writer: Mutex<LogWriter>,
    log_file_path: PathBuf,
    cancel: CancellationToken,
    consumer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogSink {
    /// Open the sink for the requested path.
    ///
    /// The log directory is created (0755) if missing; when that fails the
    /// sink falls back to the file name in the working directory, and when
    /// even the file cannot be opened it degrades to stdout for the process
    /// lifetime. None of these are fatal.
    pub fn open(requested: &Path) -> Arc<Self> {
        let path = resolve_log_path(requested);
        let writer = match open_log_file(&path) {
            Ok(file) => {
                info!(path = %path.display(), "structured log file opened");
                LogWriter::File(file)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot open log file, falling back to stdout",
                );
                LogWriter::Stdout(io::stdout())
            }
        };

        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            writer: Mutex::new(writer),
            log_file_path: path,
            cancel: CancellationToken::new(),
            consumer: Mutex::new(None),
        })
    }

    /// The path records are written to (the intended path when degraded).
    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    /// Start the consumer task.
    pub fn start(self: &Arc<Self>) {
        let sink = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sink.consumer_loop().await;
        });
        *self.consumer.lock() = Some(handle);
    }

    /// Queue a record without blocking. On overflow the oldest queued record
    /// is evicted; the warning is printed, not logged, to avoid feedback.
    pub fn enqueue(&self, record: Record) {
        let overflowed = {
            let mut queue = self.queue.lock();
            let overflowed = queue.len() >= QUEUE_CAPACITY;
            if overflowed {
                queue.pop_front();
            }
            queue.push_back(record);
            overflowed
        };

        if overflowed {
            warn!("log queue full, dropped oldest record");
        }
        self.notify.notify_one();
    }

    /// Write a record directly, bypassing the queue, and flush it.
    pub fn emit_sync(&self, record: &Record) {
        self.write_record(record);
    }

    /// Stop the consumer after the queue has drained, then flush and close.
    /// Idempotent; safe to call even if `start` never ran.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();

        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "log consumer join failed");
            }
        }

        // Anything enqueued after the consumer exited still reaches the
        // writer before close.
        self.drain_to_writer();
        debug!("log sink shut down");
    }

    async fn consumer_loop(&self) {
        loop {
            self.drain_to_writer();

            if self.cancel.is_cancelled() {
                // Producers have stopped; one more drain catches records
                // enqueued between the drain above and the flag check.
                self.drain_to_writer();
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    fn drain_to_writer(&self) {
        loop {
            // Pop under the lock, write outside it.
            let record = { self.queue.lock().pop_front() };
            match record {
                Some(record) => self.write_record(&record),
                None => break,
            }
        }
    }

    fn write_record(&self, record: &Record) {
        let line = record.to_line();
        if let Err(e) = self.writer.lock().write_line(&line) {
            warn!(error = %e, "log write failed");
        }
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Pick the path the log actually goes to: the requested path when its
/// directory exists or can be created, otherwise the bare file name in the
/// working directory.
fn resolve_log_path(requested: &Path) -> PathBuf {
    let Some(parent) = requested.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return requested.to_path_buf();
    };

    if parent.is_dir() {
        return requested.to_path_buf();
    }

    if let Err(e) = DirBuilder::new().recursive(true).mode(0o755).create(parent) {
        let fallback = requested
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("convergoor.json"));
        warn!(
            dir = %parent.display(),
            error = %e,
            fallback = %fallback.display(),
            "cannot create log directory, using working directory",
        );
        return fallback;
    }

    requested.to_path_buf()
}

/// Open for append, world-readable and world-writable where policy permits
/// (consumers of the log often run under a different account).
fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o666)
        .open(path)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::record::{Record, RecordContext};
    use super::*;

    fn ctx() -> RecordContext {
        RecordContext {
            router_name: "r1".to_string(),
            user: "tester".to_string(),
        }
    }

    fn numbered(n: i64) -> Record {
        let mut record = Record::new("route_event", &ctx(), 0);
        record.set("route_event_number", n);
        record
    }

    fn temp_log_path() -> PathBuf {
        std::env::temp_dir().join(format!("convergoor-sink-{}.json", uuid::Uuid::new_v4()))
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .expect("log file readable")
            .lines()
            .map(|l| serde_json::from_str(l).expect("valid JSON line"))
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_drain_preserves_order() {
        let path = temp_log_path();
        let sink = LogSink::open(&path);
        sink.start();

        for n in 0..50 {
            sink.enqueue(numbered(n));
        }
        sink.shutdown().await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 50);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["route_event_number"], i as i64);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let path = temp_log_path();
        let sink = LogSink::open(&path);
        // Consumer intentionally not started so the queue actually fills.
        for n in 0..(QUEUE_CAPACITY as i64 + 5) {
            sink.enqueue(numbered(n));
        }
        assert_eq!(sink.queued_len(), QUEUE_CAPACITY);

        sink.shutdown().await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), QUEUE_CAPACITY);
        // Records 0..5 were evicted; the first surviving record is #5.
        assert_eq!(lines[0]["route_event_number"], 5);
        assert_eq!(
            lines[QUEUE_CAPACITY - 1]["route_event_number"],
            QUEUE_CAPACITY as i64 + 4
        );

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_emit_sync_bypasses_queue() {
        let path = temp_log_path();
        let sink = LogSink::open(&path);

        let mut record = Record::new("monitoring_completed", &ctx(), 0);
        record.set("completed_sessions_count", 3);
        sink.emit_sync(&record);

        // Visible immediately, no consumer involved.
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["completed_sessions_count"], 3);

        sink.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let path = temp_log_path();
        let sink = LogSink::open(&path);
        sink.start();
        sink.enqueue(numbered(1));

        sink.shutdown().await;
        sink.shutdown().await;

        assert_eq!(read_lines(&path).len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_resolve_log_path_plain_filename() {
        let path = resolve_log_path(Path::new("convergence.json"));
        assert_eq!(path, PathBuf::from("convergence.json"));
    }

    #[test]
    fn test_resolve_log_path_creates_directory() {
        let dir = std::env::temp_dir().join(format!("convergoor-dir-{}", uuid::Uuid::new_v4()));
        let requested = dir.join("log.json");

        let path = resolve_log_path(&requested);
        assert_eq!(path, requested);
        assert!(dir.is_dir());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolve_log_path_falls_back_to_cwd() {
        // /proc is not writable; directory creation must fail.
        let requested = Path::new("/proc/convergoor-nope/log.json");
        let path = resolve_log_path(requested);
        assert_eq!(path, PathBuf::from("log.json"));
    }
}
