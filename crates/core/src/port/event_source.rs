// Event Source Port
// Readiness notification over raw descriptors; the monitor never sees the
// multiplexing primitive behind it (poll(2) today, anything else tomorrow).

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Caller-chosen identifier for a registered descriptor
pub type Token = usize;

/// What happened on one registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub token: Token,
    /// Data can be read without blocking
    pub readable: bool,
    /// The write side is gone; remaining data may still be buffered
    pub hangup: bool,
    /// Error or invalid descriptor
    pub error: bool,
}

/// Readiness notification over a set of descriptors
///
/// Implementations must not take ownership of descriptors. The caller keeps
/// every registered descriptor open until it has been unregistered.
pub trait EventSource {
    /// Start watching `fd` for readability under `token`
    ///
    /// # Errors
    /// - `AlreadyExists` if the token is in use
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Stop watching the descriptor behind `token`
    ///
    /// Returns false if the token was not registered.
    fn unregister(&mut self, token: Token) -> bool;

    /// Wait at most `timeout` for readiness on any registered descriptor
    ///
    /// An interrupted wait returns an empty list. With nothing registered the
    /// call just sleeps for `timeout`.
    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>>;

    /// Number of registered descriptors
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
