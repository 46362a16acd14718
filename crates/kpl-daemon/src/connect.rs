use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_DEADLINE: Duration = Duration::from_secs(2);

/// Open the read end of the in-pipe and the write end of the out-pipe.
///
/// On POSIX these opens block until the child opens the opposite ends, so
/// callers run this concurrently with child spawn. Failures are retried with
/// a 100 ms backoff for up to 2 s; on exhaustion the last error is returned.
pub(crate) fn open_channels(in_pipe: &Path, out_pipe: &Path) -> io::Result<(File, File)> {
    open_channels_within(in_pipe, out_pipe, CONNECT_DEADLINE)
}

pub(crate) fn open_channels_within(
    in_pipe: &Path,
    out_pipe: &Path,
    deadline: Duration,
) -> io::Result<(File, File)> {
    let start = Instant::now();
    loop {
        // A partially-opened in-channel is dropped (closed) before the retry
        // sleep whenever the out-channel open fails.
        match try_open(in_pipe, out_pipe) {
            Ok(channels) => {
                debug!(in_pipe = %in_pipe.display(), out_pipe = %out_pipe.display(), "channels open");
                return Ok(channels);
            }
            Err(err) => {
                debug!(%err, "connect attempt failed");
                if start.elapsed() > deadline {
                    return Err(err);
                }
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

fn try_open(in_pipe: &Path, out_pipe: &Path) -> io::Result<(File, File)> {
    let in_channel = OpenOptions::new().read(true).open(in_pipe)?;
    let out_channel = OpenOptions::new().write(true).open(out_pipe)?;
    Ok((in_channel, out_channel))
}
