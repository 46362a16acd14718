use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::DaemonConfig;
use crate::credentials::{set_credentials_message, CredentialsError};

/// Assemble the child's argument vector.
///
/// The configuration and both initial credentials messages travel on the
/// command line as uppercase unpadded hex.
pub(crate) fn build_args(
    in_pipe: &Path,
    out_pipe: &Path,
    config: &DaemonConfig,
) -> Result<Vec<OsString>, CredentialsError> {
    let primary = set_credentials_message(config.credentials_provider().as_ref(), false)?;
    let metrics = set_credentials_message(config.metrics_credentials_provider().as_ref(), true)?;

    Ok(vec![
        OsString::from("-o"),
        out_pipe.as_os_str().to_os_string(),
        OsString::from("-i"),
        in_pipe.as_os_str().to_os_string(),
        OsString::from("-c"),
        OsString::from(hex::encode_upper(config.config_message())),
        OsString::from("-k"),
        OsString::from(hex::encode_upper(primary.payload())),
        OsString::from("-w"),
        OsString::from(hex::encode_upper(metrics.payload())),
        OsString::from("-t"),
    ])
}

/// Build the spawn-ready command: argument vector, merged environment, and
/// piped stdio for the log stream readers.
pub(crate) fn build_command(
    executable: &Path,
    in_pipe: &Path,
    out_pipe: &Path,
    config: &DaemonConfig,
) -> Result<Command, CredentialsError> {
    let mut command = Command::new(executable);
    command.args(build_args(in_pipe, out_pipe, config)?);
    command.envs(config.environment());
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(command)
}
