//! Cooperative event loop for a session.
//!
//! The session owns the loop rather than inheriting from it. There are
//! exactly two wake sources:
//! - readiness of the control socket (non-urgent data), observed via `poll`,
//! - the urgent-data and broken-pipe signals, latched by async-signal-safe
//!   flags and consumed here so the notifier work always runs on the loop
//!   thread.
//!
//! Urgent wakeups win over regular input: an interrupt must be classified
//! before the next queued request is pulled.

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What woke the loop up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
  /// A regular frame is readable on the control socket.
  SocketReady,
  /// SIGURG arrived (urgent byte pending).
  UrgentSignal,
  /// SIGPIPE arrived (keep-alive detected peer death).
  PipeSignal,
  /// Poll period elapsed with nothing to do.
  Idle,
}

/// Latched signal state shared with handlers that poll mid-request.
#[derive(Clone)]
pub struct SignalFlags {
  urgent: Arc<AtomicBool>,
  pipe: Arc<AtomicBool>,
}

impl SignalFlags {
  /// Registers the SIGURG and SIGPIPE flag handlers.
  pub fn install() -> Result<Self> {
    let urgent = Arc::new(AtomicBool::new(false));
    let pipe = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(libc::SIGURG, urgent.clone())
      .context("register SIGURG handler")?;
    signal_hook::flag::register(libc::SIGPIPE, pipe.clone())
      .context("register SIGPIPE handler")?;
    Ok(Self { urgent, pipe })
  }

  /// Non-consuming check used by long-running handlers at safe points.
  pub fn urgent_pending(&self) -> bool {
    self.urgent.load(Ordering::Relaxed)
  }

  pub fn take_urgent(&self) -> bool {
    self.urgent.swap(false, Ordering::Relaxed)
  }

  pub fn take_pipe(&self) -> bool {
    self.pipe.swap(false, Ordering::Relaxed)
  }

  #[cfg(test)]
  pub fn fake() -> Self {
    Self {
      urgent: Arc::new(AtomicBool::new(false)),
      pipe: Arc::new(AtomicBool::new(false)),
    }
  }

  #[cfg(test)]
  pub fn raise_urgent(&self) {
    self.urgent.store(true, Ordering::Relaxed);
  }
}

pub struct EventLoop {
  signals: SignalFlags,
}

impl EventLoop {
  pub fn new(signals: SignalFlags) -> Self {
    Self { signals }
  }

  pub fn signals(&self) -> &SignalFlags {
    &self.signals
  }

  /// Waits for the next wakeup on the given control descriptor.
  ///
  /// Signals latched while a previous handler ran are consumed before any
  /// socket readiness is reported. `POLLPRI` (out-of-band data queued) is
  /// treated like the urgent signal for platforms where SIGURG delivery and
  /// readiness race.
  pub fn wait(&self, fd: BorrowedFd<'_>) -> Result<Wakeup> {
    if self.signals.take_pipe() {
      return Ok(Wakeup::PipeSignal);
    }
    if self.signals.take_urgent() {
      return Ok(Wakeup::UrgentSignal);
    }

    let mut fds = [PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLPRI)];
    match poll(&mut fds, PollTimeout::from(250u16)) {
      Ok(0) => Ok(Wakeup::Idle),
      Ok(_) => {
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLPRI) {
          self.signals.take_urgent();
          return Ok(Wakeup::UrgentSignal);
        }
        // POLLHUP/POLLERR fall through to the read path, which observes the
        // close and terminates the session.
        Ok(Wakeup::SocketReady)
      }
      Err(nix::errno::Errno::EINTR) => Ok(Wakeup::Idle),
      Err(e) => Err(e).context("poll control socket"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::os::unix::net::UnixStream;

  #[test]
  fn socket_readiness_wakes_the_loop() {
    let (mut a, b) = UnixStream::pair().unwrap();
    let events = EventLoop::new(SignalFlags::fake());
    a.write_all(b"x").unwrap();
    use std::os::fd::AsFd;
    assert_eq!(events.wait(b.as_fd()).unwrap(), Wakeup::SocketReady);
  }

  #[test]
  fn latched_urgent_flag_wins_over_readable_socket() {
    let (mut a, b) = UnixStream::pair().unwrap();
    let flags = SignalFlags::fake();
    let events = EventLoop::new(flags.clone());
    a.write_all(b"x").unwrap();
    flags.raise_urgent();
    use std::os::fd::AsFd;
    assert_eq!(events.wait(b.as_fd()).unwrap(), Wakeup::UrgentSignal);
    // The flag was consumed; the queued byte is reported next.
    assert_eq!(events.wait(b.as_fd()).unwrap(), Wakeup::SocketReady);
  }

  #[test]
  fn idle_when_nothing_is_queued() {
    let (_a, b) = UnixStream::pair().unwrap();
    let events = EventLoop::new(SignalFlags::fake());
    use std::os::fd::AsFd;
    assert_eq!(events.wait(b.as_fd()).unwrap(), Wakeup::Idle);
  }
}
