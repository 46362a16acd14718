use std::fs::File;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use kpl_frame::{FrameReader, FrameWriter, Message};
use kpl_pipe::{PipeError, PipePair};
use tracing::{debug, error, info};

use crate::config::DaemonConfig;
use crate::connect;
use crate::credentials::set_credentials_message;
use crate::error::{BoxError, DaemonError};
use crate::handler::MessageHandler;
use crate::launcher;
use crate::log_reader::{LogStreamReader, StreamLevel};

/// How often blocking queue takes re-check the shutdown latch.
const QUEUE_POLL: Duration = Duration::from_millis(100);
/// Child exit poll granularity; `try_wait` lets the arbiter kill concurrently.
const CHILD_EXIT_POLL: Duration = Duration::from_millis(10);
/// How long the arbiter waits for pump loops to finish cooperatively.
const LOOP_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const LOOP_FINISH_POLL: Duration = Duration::from_millis(10);

/// Supervisor for the long-lived native producer child process.
///
/// Cheap to clone handles are not provided; the `Daemon` itself is the
/// caller-facing handle and all pump loops hold the shared state internally.
pub struct Daemon {
    inner: Arc<Shared>,
}

/// Pipe paths in use, and whether this supervisor created the files.
enum PipeState {
    /// Created by this supervisor; removed on teardown.
    Owned(PipePair),
    /// Pre-existing pipes bound via [`Daemon::connect`]; left in place.
    Borrowed { in_pipe: PathBuf, out_pipe: PathBuf },
}

impl PipeState {
    fn in_pipe(&self) -> &Path {
        match self {
            Self::Owned(pair) => pair.in_pipe(),
            Self::Borrowed { in_pipe, .. } => in_pipe,
        }
    }

    fn out_pipe(&self) -> &Path {
        match self {
            Self::Owned(pair) => pair.out_pipe(),
            Self::Borrowed { out_pipe, .. } => out_pipe,
        }
    }
}

struct Shared {
    shutdown: AtomicBool,
    handler: Arc<dyn MessageHandler>,
    config: Option<DaemonConfig>,
    executable: Option<PathBuf>,
    working_dir: PathBuf,
    pipes: Mutex<Option<PipeState>>,
    outbound_tx: Sender<Message>,
    outbound_rx: Mutex<Option<Receiver<Message>>>,
    outbound_depth: AtomicUsize,
    process: Mutex<Option<Child>>,
    loop_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    log_readers: Mutex<Vec<LogStreamReader>>,
}

/// Lock a mutex, recovering the guard if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Daemon {
    /// Start the child and begin pumping messages.
    ///
    /// Returns immediately: pipe creation, spawn, and connection happen on
    /// background threads, and any failure along the way reaches the handler
    /// as its single `on_error`.
    pub fn start(
        executable: impl Into<PathBuf>,
        handler: Arc<dyn MessageHandler>,
        working_dir: impl Into<PathBuf>,
        config: DaemonConfig,
    ) -> Self {
        let inner = Shared::new(
            Some(executable.into()),
            handler,
            working_dir.into(),
            Some(config),
        );
        let bootstrap_shared = Arc::clone(&inner);
        thread::spawn(move || bootstrap(&bootstrap_shared));
        Self { inner }
    }

    /// Connect on existing pipes, without starting a child process.
    ///
    /// Binds to pre-made pipe files so tests can stand in for the child.
    /// The pipes are not owned: teardown leaves the files in place. Blocks
    /// until the peer opens the opposite ends or the retry window lapses.
    pub fn connect(
        in_pipe: impl Into<PathBuf>,
        out_pipe: impl Into<PathBuf>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let in_pipe = in_pipe.into();
        let out_pipe = out_pipe.into();
        let inner = Shared::new(None, handler, PathBuf::from("."), None);
        *lock(&inner.pipes) = Some(PipeState::Borrowed {
            in_pipe: in_pipe.clone(),
            out_pipe: out_pipe.clone(),
        });

        match connect::open_channels(&in_pipe, &out_pipe) {
            Ok((in_channel, out_channel)) => start_loops(&inner, in_channel, out_channel),
            Err(err) => {
                inner.fatal_error("Could not connect to child", Some(Box::new(err)), false)
            }
        }
        Self { inner }
    }

    /// Enqueue a message to be sent to the child process.
    pub fn add(&self, message: Message) -> Result<(), DaemonError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(DaemonError::ShutDown);
        }
        if !self.inner.enqueue_outbound(message) {
            self.inner.fatal_error("Unexpected error", None, true);
            return Err(DaemonError::ShutDown);
        }
        Ok(())
    }

    /// Kill the child process and shut this supervisor down.
    pub fn destroy(&self) {
        self.inner.fatal_error("Destroy is called", None, true);
    }

    /// Number of messages waiting on the outbound queue.
    pub fn queue_size(&self) -> usize {
        self.inner.outbound_depth.load(Ordering::SeqCst)
    }

    /// Path of the pipe the supervisor reads from, once known.
    pub fn in_pipe(&self) -> Option<PathBuf> {
        lock(&self.inner.pipes)
            .as_ref()
            .map(|state| state.in_pipe().to_path_buf())
    }

    /// Path of the pipe the supervisor writes to, once known.
    pub fn out_pipe(&self) -> Option<PathBuf> {
        lock(&self.inner.pipes)
            .as_ref()
            .map(|state| state.out_pipe().to_path_buf())
    }

    /// Path of the child executable; `None` for pipe-bound supervisors.
    pub fn path_to_executable(&self) -> Option<&Path> {
        self.inner.executable.as_deref()
    }

    /// Working directory the pipes are created in.
    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    /// The registered message handler.
    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.inner.handler
    }

    /// OS id of the child process, once spawned.
    pub fn process_id(&self) -> Option<u32> {
        lock(&self.inner.process).as_ref().map(Child::id)
    }
}

impl Shared {
    fn new(
        executable: Option<PathBuf>,
        handler: Arc<dyn MessageHandler>,
        working_dir: PathBuf,
        config: Option<DaemonConfig>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel();
        Arc::new(Self {
            shutdown: AtomicBool::new(false),
            handler,
            config,
            executable,
            working_dir,
            pipes: Mutex::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            outbound_depth: AtomicUsize::new(0),
            process: Mutex::new(None),
            loop_threads: Mutex::new(Vec::new()),
            log_readers: Mutex::new(Vec::new()),
        })
    }

    /// Put a message on the outbound queue. Returns false once the send
    /// loop has gone away, which only happens during shutdown.
    fn enqueue_outbound(&self, message: Message) -> bool {
        self.outbound_depth.fetch_add(1, Ordering::SeqCst);
        if self.outbound_tx.send(message).is_err() {
            self.outbound_depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn pipe_paths(&self) -> Option<(PathBuf, PathBuf)> {
        lock(&self.pipes).as_ref().map(|state| {
            (
                state.in_pipe().to_path_buf(),
                state.out_pipe().to_path_buf(),
            )
        })
    }

    /// Enqueue one refresh cycle: primary credentials, then metrics
    /// credentials (falling back to the primary provider).
    fn update_credentials(&self, config: &DaemonConfig) {
        match set_credentials_message(config.credentials_provider().as_ref(), false) {
            Ok(message) => {
                if !self.enqueue_outbound(message) {
                    return;
                }
            }
            Err(err) => {
                error!(%err, "failed to refresh credentials, will retry after refresh delay");
                return;
            }
        }
        match set_credentials_message(config.metrics_credentials_provider().as_ref(), true) {
            Ok(message) => {
                self.enqueue_outbound(message);
            }
            Err(err) => {
                error!(%err, "failed to refresh metrics credentials, will retry after refresh delay");
            }
        }
    }

    /// Collapse a fatal event into the single shutdown edge.
    ///
    /// Only the first caller takes the edge; every later call returns
    /// immediately. The winning caller kills the child, waits for the pump
    /// loops, removes owned pipe files, and delivers the one `on_error`.
    fn fatal_error(&self, message: &str, cause: Option<BoxError>, retryable: bool) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        error!(retryable, "fatal event, shutting down supervisor: {message}");

        {
            let mut process = lock(&self.process);
            if let Some(child) = process.as_mut() {
                for reader in lock(&self.log_readers).iter() {
                    reader.prepare_for_shutdown();
                }
                if let Err(err) = child.kill() {
                    debug!(%err, "failed to kill child process");
                }
            }
        }

        // A connector still blocked in a FIFO open is released by opening the
        // opposite ends; the descriptors stay alive until teardown completes
        // so the connector's second open cannot re-block.
        let _nudge = self.nudge_pipes();

        let deadline = Instant::now() + LOOP_SHUTDOWN_GRACE;
        let threads = std::mem::take(&mut *lock(&self.loop_threads));
        let current = thread::current().id();
        for handle in &threads {
            if handle.thread().id() == current {
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(LOOP_FINISH_POLL);
            }
        }
        drop(threads); // loops that ignored the grace period stay detached

        // Killing the child closed its output streams; let the readers drain
        // what remains within the same deadline.
        let readers = std::mem::take(&mut *lock(&self.log_readers));
        for reader in &readers {
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(LOOP_FINISH_POLL);
            }
        }

        if let Some(PipeState::Owned(pair)) = lock(&self.pipes).as_ref() {
            pair.remove();
        }

        self.handler
            .on_error(DaemonError::fatal(message, cause, retryable));
    }

    #[cfg(unix)]
    fn nudge_pipes(&self) -> Vec<File> {
        use std::os::unix::fs::OpenOptionsExt;

        let mut held = Vec::new();
        if let Some((in_pipe, out_pipe)) = self.pipe_paths() {
            if let Ok(file) = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&out_pipe)
            {
                held.push(file);
            }
            if let Ok(file) = std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&in_pipe)
            {
                held.push(file);
            }
        }
        held
    }

    #[cfg(not(unix))]
    fn nudge_pipes(&self) -> Vec<File> {
        Vec::new()
    }
}

/// Spawn-path bootstrap: create the pipe pair, then launch the child.
fn bootstrap(shared: &Arc<Shared>) {
    match PipePair::create(&shared.working_dir) {
        Ok(pair) => {
            *lock(&shared.pipes) = Some(PipeState::Owned(pair));
        }
        Err(err) => {
            let message = match &err {
                PipeError::NeverAppeared { .. } => "Pipes did not show up after calling mkfifo",
                _ => "Error creating pipes",
            };
            shared.fatal_error(message, Some(Box::new(err)), false);
            return;
        }
    }
    start_child(shared);
}

/// Spawn the child, wire up its log streams, and watch for its exit.
fn start_child(shared: &Arc<Shared>) {
    let Some(config) = shared.config.as_ref() else {
        return;
    };
    let Some(executable) = shared.executable.clone() else {
        return;
    };
    let Some((in_pipe, out_pipe)) = shared.pipe_paths() else {
        return;
    };

    let mut command = match launcher::build_command(&executable, &in_pipe, &out_pipe, config) {
        Ok(command) => command,
        Err(err) => {
            shared.fatal_error("Error starting child process", Some(Box::new(err)), false);
            return;
        }
    };

    // The connector must already be waiting in its blocking opens when the
    // child opens its ends of the pipes.
    let connector_shared = Arc::clone(shared);
    thread::spawn(move || connect_and_start_loops(&connector_shared));

    info!(executable = %executable.display(), "starting native producer process");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            shared.fatal_error("Error starting child process", Some(Box::new(err)), false);
            return;
        }
    };

    {
        let mut readers = lock(&shared.log_readers);
        if let Some(stdout) = child.stdout.take() {
            readers.push(LogStreamReader::spawn(stdout, "StdOut", StreamLevel::Info));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(LogStreamReader::spawn(stderr, "StdErr", StreamLevel::Warn));
        }
    }

    *lock(&shared.process) = Some(child);
    // The arbiter may have raced the spawn; make sure a latched shutdown
    // never leaves the child running.
    if shared.shutdown.load(Ordering::Acquire) {
        if let Some(child) = lock(&shared.process).as_mut() {
            let _ = child.kill();
        }
    }

    wait_for_child_exit(shared);
}

/// Block until the child exits. Any exit is fatal; only code 1 is
/// irrecoverable.
fn wait_for_child_exit(shared: &Arc<Shared>) {
    loop {
        let waited = lock(&shared.process).as_mut().map(Child::try_wait);
        match waited {
            Some(Ok(Some(status))) => {
                info!(%status, "child process exited");
                let (message, retryable) = match status.code() {
                    Some(code) => (format!("Child process exited with code {code}"), code != 1),
                    None => (format!("Child process exited abnormally ({status})"), true),
                };
                shared.fatal_error(&message, None, retryable);
                return;
            }
            Some(Ok(None)) => thread::sleep(CHILD_EXIT_POLL),
            Some(Err(err)) => {
                shared.fatal_error("Error waiting for child process", Some(Box::new(err)), true);
                return;
            }
            None => return,
        }
    }
}

/// Open both channel ends, then hand them to the pump loops.
fn connect_and_start_loops(shared: &Arc<Shared>) {
    let Some((in_pipe, out_pipe)) = shared.pipe_paths() else {
        return;
    };
    match connect::open_channels(&in_pipe, &out_pipe) {
        Ok((in_channel, out_channel)) => start_loops(shared, in_channel, out_channel),
        Err(err) => shared.fatal_error(
            "Unexpected error connecting to child process",
            Some(Box::new(err)),
            false,
        ),
    }
}

/// Start the send, receive, dispatch, and credential-refresh loops.
fn start_loops(shared: &Arc<Shared>, in_channel: File, out_channel: File) {
    let Some(outbound_rx) = lock(&shared.outbound_rx).take() else {
        return;
    };
    let (inbound_tx, inbound_rx) = mpsc::channel();

    let mut threads = Vec::with_capacity(4);
    {
        let shared = Arc::clone(shared);
        threads.push(thread::spawn(move || {
            send_loop(&shared, outbound_rx, out_channel)
        }));
    }
    {
        let shared = Arc::clone(shared);
        threads.push(thread::spawn(move || {
            receive_loop(&shared, in_channel, inbound_tx)
        }));
    }
    {
        let shared = Arc::clone(shared);
        threads.push(thread::spawn(move || dispatch_loop(&shared, inbound_rx)));
    }
    if let Some(config) = shared.config.clone() {
        let shared = Arc::clone(shared);
        threads.push(thread::spawn(move || credentials_loop(&shared, &config)));
    }
    lock(&shared.loop_threads).extend(threads);
}

/// Write queued messages to the child, one frame per message, in order.
fn send_loop(shared: &Shared, outbound_rx: Receiver<Message>, out_channel: File) {
    let mut writer = FrameWriter::new(out_channel);
    while !shared.shutdown.load(Ordering::Acquire) {
        match outbound_rx.recv_timeout(QUEUE_POLL) {
            Ok(message) => {
                shared.outbound_depth.fetch_sub(1, Ordering::SeqCst);
                if let Err(err) = writer.write_message(&message) {
                    shared.fatal_error(
                        "Error writing message to daemon",
                        Some(Box::new(err)),
                        true,
                    );
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Read frames from the child onto the inbound queue.
fn receive_loop(shared: &Shared, in_channel: File, inbound_tx: Sender<Message>) {
    let mut reader = FrameReader::new(in_channel);
    while !shared.shutdown.load(Ordering::Acquire) {
        match reader.read_message() {
            Ok(message) => {
                if inbound_tx.send(message).is_err() {
                    return;
                }
            }
            Err(err) => {
                shared.fatal_error("Error reading message from daemon", Some(Box::new(err)), true);
                return;
            }
        }
    }
}

/// Hand inbound messages to the handler, in receive order.
fn dispatch_loop(shared: &Shared, inbound_rx: Receiver<Message>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match inbound_rx.recv_timeout(QUEUE_POLL) {
            Ok(message) => {
                let handler = Arc::clone(&shared.handler);
                if std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message)))
                    .is_err()
                {
                    error!("message handler panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Periodically enqueue fresh credentials for the child.
///
/// Provider failures are logged and retried on the next cycle; this loop
/// never latches the shutdown edge itself. The sleep is not interrupted by
/// shutdown; the outer check ends the loop on the next pass.
fn credentials_loop(shared: &Shared, config: &DaemonConfig) {
    while !shared.shutdown.load(Ordering::Acquire) {
        shared.update_credentials(config);
        thread::sleep(config.credentials_refresh_delay());
    }
}
