use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

/// Log level applied to a child output stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StreamLevel {
    /// Child stdout.
    Info,
    /// Child stderr.
    Warn,
}

/// Drains one of the child's output streams into the log.
///
/// Runs until EOF. Killing the child closes the stream, which is what
/// unblocks a reader waiting on a quiet child; `prepare_for_shutdown` only
/// silences read-error noise while the remaining buffered output drains.
pub(crate) struct LogStreamReader {
    draining: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LogStreamReader {
    /// Spawn a reader thread over `stream`.
    pub(crate) fn spawn(
        stream: impl Read + Send + 'static,
        stream_name: &'static str,
        level: StreamLevel,
    ) -> Self {
        let draining = Arc::new(AtomicBool::new(false));
        let thread = {
            let draining = Arc::clone(&draining);
            std::thread::spawn(move || run(stream, stream_name, level, &draining))
        };
        Self { draining, thread }
    }

    /// Switch the reader into drain mode ahead of child termination.
    pub(crate) fn prepare_for_shutdown(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Whether the reader thread has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

fn run(stream: impl Read, stream_name: &str, level: StreamLevel, draining: &AtomicBool) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        match line {
            Ok(line) => match level {
                StreamLevel::Info => info!(stream = stream_name, "{line}"),
                StreamLevel::Warn => warn!(stream = stream_name, "{line}"),
            },
            Err(err) => {
                if !draining.load(Ordering::Acquire) {
                    debug!(stream = stream_name, %err, "child log stream read failed");
                }
                break;
            }
        }
    }
    debug!(stream = stream_name, "child log stream closed");
}
