//! Process-wide error reporter.
//!
//! Every operational report goes to three places: a human-readable line on
//! stderr, a syslog entry prefixed with the user identity, and on the abort
//! path a single `FATAL` frame to the peer so it can stop waiting.
//! `SysError` and above abort after a stack trace; severities below return
//! to the caller. The peer notification is guarded against re-entry: a
//! failure inside the send must not recurse into the reporter.
//!
//! This is the only component with a process-global access point. Sessions
//! carry their state explicitly; the reporter cannot, because it is reached
//! from arbitrary call sites that have no session in hand.

use crate::protocol::{Message, Tag, write_frame};
use crate::syslog;
use std::backtrace::Backtrace;
use std::io::Write;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
  Info,
  Warning,
  Error,
  SysError,
  Fatal,
}

impl Severity {
  fn label(self) -> &'static str {
    match self {
      Severity::Info => "Info",
      Severity::Warning => "Warning",
      Severity::Error => "Error",
      Severity::SysError => "SysError",
      Severity::Fatal => "Fatal",
    }
  }

  fn priority(self) -> syslog::Priority {
    match self {
      Severity::Info => syslog::Priority::Info,
      Severity::Warning => syslog::Priority::Warning,
      _ => syslog::Priority::Err,
    }
  }

  /// `SysError` and above take the session down.
  fn aborts(self) -> bool {
    matches!(self, Severity::SysError | Severity::Fatal)
  }
}

struct Reporter {
  user: Mutex<String>,
  fatal_peer: AtomicI32,
  fatal_sent: AtomicBool,
}

static REPORTER: OnceLock<Reporter> = OnceLock::new();

fn reporter() -> &'static Reporter {
  REPORTER.get_or_init(|| Reporter {
    user: Mutex::new(String::new()),
    fatal_peer: AtomicI32::new(-1),
    fatal_sent: AtomicBool::new(false),
  })
}

/// Records the authenticated user identity for the syslog prefix.
pub fn set_user(user: &str) {
  if let Ok(mut u) = reporter().user.lock() {
    *u = user.to_string();
  }
}

/// Points the fatal path at the control socket descriptor.
pub fn set_fatal_peer(fd: RawFd) {
  reporter().fatal_peer.store(fd, Ordering::Relaxed);
}

/// Reports one line. `SysError` and above notify the peer, print a stack
/// trace and abort; lower severities return to the caller.
pub fn report(severity: Severity, location: &str, msg: &str) {
  emit(severity, location, msg);
  if severity.aborts() {
    abort_with_peer_notice();
  }
}

/// Reports with the OS error string appended, at `SysError` severity.
/// Aborts, like every other `SysError`.
pub fn sys_report(location: &str, msg: &str, err: &std::io::Error) {
  report(Severity::SysError, location, &format!("{} ({})", msg, err));
}

/// `SysError` entry that returns to the caller instead of aborting.
///
/// Reserved for the file receiver and the log streamer, which hand a
/// structured failure code back to the dispatcher; everything else goes
/// through [`sys_report`].
pub fn sys_report_returning(location: &str, msg: &str, err: &std::io::Error) {
  emit(Severity::SysError, location, &format!("{} ({})", msg, err));
}

fn emit(severity: Severity, location: &str, msg: &str) {
  let r = reporter();

  if location.is_empty() {
    eprintln!("{}: {}", severity.label(), msg);
  } else {
    eprintln!("{} [in {}]: {}", severity.label(), location, msg);
  }
  let _ = std::io::stderr().flush();

  let user = r.user.lock().map(|u| u.clone()).unwrap_or_default();
  if location.is_empty() {
    syslog::log(severity.priority(), &format!("{}:{}:{}", user, severity.label(), msg));
  } else {
    syslog::log(
      severity.priority(),
      &format!("{}:{}:<{}>:{}", user, severity.label(), location, msg),
    );
  }
}

/// Single-shot `FATAL` notification to the peer, then stack trace and abort.
fn abort_with_peer_notice() -> ! {
  let r = reporter();
  if !r.fatal_sent.swap(true, Ordering::SeqCst) {
    let fd = r.fatal_peer.load(Ordering::Relaxed);
    if fd >= 0 {
      let _ = write_frame(RawFdWriter(fd), &Message::new(Tag::Fatal));
    }
  }
  eprintln!("aborting");
  eprintln!("{}", Backtrace::force_capture());
  let _ = std::io::stderr().flush();
  std::process::abort();
}

/// Writes to a descriptor the reporter does not own.
struct RawFdWriter(RawFd);

impl Write for RawFdWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
      Err(std::io::Error::last_os_error())
    } else {
      Ok(n as usize)
    }
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}
