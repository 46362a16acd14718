#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kpl_daemon::{DaemonError, Message, MessageHandler};

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Handler that records everything it is given, for assertions.
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<Message>>,
    errors: Mutex<Vec<DaemonError>>,
}

impl RecordingHandler {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("messages lock").clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().expect("messages lock").len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().expect("errors lock").len()
    }

    /// Run an assertion against the first recorded error.
    pub fn first_error_matches(&self, predicate: impl FnOnce(&DaemonError) -> bool) -> bool {
        let errors = self.errors.lock().expect("errors lock");
        errors.first().is_some_and(predicate)
    }

    pub fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.message_count() >= count)
    }

    pub fn wait_for_error(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.error_count() >= 1)
    }
}

impl MessageHandler for RecordingHandler {
    fn on_message(&self, message: Message) {
        self.messages.lock().expect("messages lock").push(message);
    }

    fn on_error(&self, error: DaemonError) {
        self.errors.lock().expect("errors lock").push(error);
    }
}

/// Poll until `condition` holds or `timeout` lapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(WAIT_POLL);
    }
    condition()
}

/// Whether `needle` appears anywhere in the error's display chain.
pub fn error_chain_contains(error: &DaemonError, needle: &str) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = current {
        if err.to_string().contains(needle) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Fresh per-test working directory.
pub fn make_workdir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/kpl-daemon-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}
