use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

#[cfg(unix)]
use crate::error::PipeError;
use crate::error::Result;

#[cfg(unix)]
const PIPE_VISIBILITY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
#[cfg(unix)]
const PIPE_VISIBILITY_POLL: std::time::Duration = std::time::Duration::from_millis(10);

/// A uniquely-named pipe pair owned by one supervisor.
///
/// `in_pipe` is read by the supervisor (the child writes to it); `out_pipe`
/// is written by the supervisor. Dropping the pair removes any files it
/// created; paths are also registered for removal on process exit as a
/// safety net for crash paths.
#[derive(Debug)]
pub struct PipePair {
    in_pipe: PathBuf,
    out_pipe: PathBuf,
}

impl PipePair {
    /// Create a fresh pipe pair under `workdir`.
    ///
    /// On POSIX the directory is created if missing and both paths are
    /// FIFOs made with `mkfifo(2)`, polled until visible. On Windows only
    /// the `\\.\pipe\` names are allocated; the child creates the server
    /// ends.
    pub fn create(workdir: &Path) -> Result<Self> {
        #[cfg(unix)]
        let pair = Self::create_posix(workdir)?;
        #[cfg(not(unix))]
        let pair = Self::create_windows(workdir)?;

        register_delete_on_exit(&pair.in_pipe);
        register_delete_on_exit(&pair.out_pipe);
        Ok(pair)
    }

    #[cfg(unix)]
    fn create_posix(workdir: &Path) -> Result<Self> {
        use std::time::Instant;

        use nix::sys::stat::Mode;

        if !workdir.exists() {
            std::fs::create_dir_all(workdir).map_err(|source| PipeError::Workdir {
                path: workdir.to_path_buf(),
                source,
            })?;
        }

        let in_pipe = roll_unused_path(workdir, "in");
        let out_pipe = roll_unused_path(workdir, "out");

        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        for path in [&in_pipe, &out_pipe] {
            nix::unistd::mkfifo(path.as_path(), mode).map_err(|errno| PipeError::Create {
                path: path.clone(),
                source: std::io::Error::from(errno),
            })?;
        }

        // mkfifo is synchronous, but visibility is still polled: the paths
        // may sit on a filesystem that exposes new entries lazily.
        let start = Instant::now();
        while !in_pipe.exists() || !out_pipe.exists() {
            if start.elapsed() > PIPE_VISIBILITY_TIMEOUT {
                return Err(PipeError::NeverAppeared {
                    timeout: PIPE_VISIBILITY_TIMEOUT,
                });
            }
            std::thread::sleep(PIPE_VISIBILITY_POLL);
        }

        info!(in_pipe = %in_pipe.display(), out_pipe = %out_pipe.display(), "created fifo pair");
        Ok(Self { in_pipe, out_pipe })
    }

    #[cfg(not(unix))]
    fn create_windows(_workdir: &Path) -> Result<Self> {
        let pipe_root = Path::new(r"\\.\pipe");
        let in_pipe = roll_unused_path(pipe_root, "in");
        let out_pipe = roll_unused_path(pipe_root, "out");

        info!(in_pipe = %in_pipe.display(), out_pipe = %out_pipe.display(), "allocated pipe names");
        Ok(Self { in_pipe, out_pipe })
    }

    /// Path the supervisor reads from.
    pub fn in_pipe(&self) -> &Path {
        &self.in_pipe
    }

    /// Path the supervisor writes to.
    pub fn out_pipe(&self) -> &Path {
        &self.out_pipe
    }

    /// Unlink both pipe files. Idempotent; missing files are ignored.
    pub fn remove(&self) {
        for path in [&self.in_pipe, &self.out_pipe] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), %err, "failed to unlink pipe");
                }
            }
        }
    }
}

impl Drop for PipePair {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Generate `<dir>/amz-aws-kpl-{side}-pipe-<8hex>`, re-rolling until the
/// path does not exist yet.
fn roll_unused_path(dir: &Path, side: &str) -> PathBuf {
    loop {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let candidate = dir.join(format!("amz-aws-kpl-{side}-pipe-{suffix}"));
        if !candidate.exists() {
            return candidate;
        }
    }
}

mod exit_cleanup {
    use std::path::{Path, PathBuf};
    use std::sync::{Mutex, OnceLock};

    static REGISTRY: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();

    extern "C" fn remove_registered_pipes() {
        if let Some(registry) = REGISTRY.get() {
            if let Ok(paths) = registry.lock() {
                for path in paths.iter() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }

    pub(super) fn register(path: &Path) {
        let registry = REGISTRY.get_or_init(|| {
            // SAFETY: remove_registered_pipes is a valid extern "C" fn with
            // no arguments and touches only this registry.
            unsafe {
                libc::atexit(remove_registered_pipes);
            }
            Mutex::new(Vec::new())
        });
        if let Ok(mut paths) = registry.lock() {
            paths.push(path.to_path_buf());
        }
    }
}

fn register_delete_on_exit(path: &Path) {
    exit_cleanup::register(path);
}
