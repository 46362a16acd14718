//! Supervisor for the long-lived native producer child process.
//!
//! The [`Daemon`] owns the child's lifecycle: it creates a pair of
//! uniquely-named FIFOs, spawns the child with its configuration and initial
//! credentials hex-encoded on the command line, connects a length-prefixed
//! framed transport over the pipes, and pumps messages between the in-process
//! producer API and the child. Credentials are refreshed periodically by
//! enqueueing typed set-credentials messages on the same outbound queue as
//! user traffic, so the child observes refreshes in strict order.
//!
//! Any fatal event (an I/O failure, a protocol violation, child exit, or an
//! explicit [`Daemon::destroy`]) collapses into a single shutdown edge: the
//! child is killed, the pump loops are cancelled, the pipe files are removed,
//! and the handler's [`MessageHandler::on_error`] is invoked exactly once
//! with a retryable or irrecoverable [`DaemonError`].

pub mod config;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod handler;

mod connect;
mod launcher;
mod log_reader;

pub use config::DaemonConfig;
pub use credentials::{Credentials, CredentialsError, CredentialsProvider, StaticCredentialsProvider};
pub use daemon::Daemon;
pub use error::{DaemonError, Result};
pub use handler::MessageHandler;

pub use kpl_frame::Message;
