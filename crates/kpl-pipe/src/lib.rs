//! FIFO / named-pipe pair factory for the producer child transport.
//!
//! The supervisor and the child exchange frames over two uni-directional
//! pipes. On POSIX these are FIFOs created with `mkfifo(2)` in a working
//! directory; on Windows they are `\\.\pipe\` names whose server end the
//! child creates. Created files are unlinked on teardown and registered in
//! a process-exit cleanup net for crash paths.

pub mod error;
pub mod factory;

pub use error::{PipeError, Result};
pub use factory::PipePair;
