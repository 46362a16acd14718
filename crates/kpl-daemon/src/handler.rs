use kpl_frame::Message;

use crate::error::DaemonError;

/// Callback surface used by clients to receive messages and errors.
///
/// `on_message` is invoked once per inbound frame, in receive order, from a
/// single dispatch thread. `on_error` is invoked at most once over the
/// supervisor's lifetime, after the shutdown edge has been taken.
///
/// Panics escaping `on_message` are caught and logged; a handler bug never
/// brings the supervisor down.
pub trait MessageHandler: Send + Sync {
    /// A message arrived from the child.
    fn on_message(&self, message: Message);

    /// The supervisor hit a fatal event and has shut down.
    fn on_error(&self, error: DaemonError);
}
