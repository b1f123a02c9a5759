// poll(2) event source
// reason: nix for a safe poll wrapper without pulling in an async runtime
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use netlab_core::port::{EventSource, Readiness, Token};

/// Level-triggered readiness over pipes using poll(2)
#[derive(Debug, Default)]
pub struct PollEventSource {
    entries: Vec<(Token, RawFd)>,
}

impl PollEventSource {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Whole milliseconds, rounded up so short waits still block, clamped to u16
fn timeout_millis(timeout: Duration) -> u16 {
    let millis = timeout.as_micros().div_ceil(1000);
    u16::try_from(millis).unwrap_or(u16::MAX)
}

impl EventSource for PollEventSource {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        if self.entries.iter().any(|(t, _)| *t == token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("token {} already registered", token),
            ));
        }
        debug!(fd = %fd, token = %token, "Descriptor registered");
        self.entries.push((token, fd));
        Ok(())
    }

    fn unregister(&mut self, token: Token) -> bool {
        match self.entries.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                self.entries.remove(index);
                debug!(token = %token, "Descriptor unregistered");
                true
            }
            None => false,
        }
    }

    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<Readiness>> {
        if self.entries.is_empty() {
            thread::sleep(timeout);
            return Ok(Vec::new());
        }

        let mut fds: Vec<PollFd<'_>> = self
            .entries
            .iter()
            .map(|(_, fd)| {
                // SAFETY: registered descriptors stay open until unregistered
                let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(fd, PollFlags::POLLIN)
            })
            .collect();

        match poll(&mut fds, PollTimeout::from(timeout_millis(timeout))) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(io::Error::from(e)),
        }

        let ready = fds
            .iter()
            .zip(&self.entries)
            .filter_map(|(fd, (token, _))| {
                let revents = fd.revents()?;
                if revents.is_empty() {
                    return None;
                }
                Some(Readiness {
                    token: *token,
                    readable: revents.contains(PollFlags::POLLIN),
                    hangup: revents.contains(PollFlags::POLLHUP),
                    error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                })
            })
            .collect();

        Ok(ready)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
