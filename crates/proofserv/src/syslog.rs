//! Thin binding over the platform syslog.
//!
//! Masters log to `local5`, workers to `local6`; both pass `PID | CONS` so
//! entries carry the process id and fall back to the console if the log
//! daemon is unreachable. `openlog` keeps the ident pointer, so the ident
//! lives in a process-wide static.

use std::ffi::CString;
use std::sync::OnceLock;

#[derive(Copy, Clone, Debug)]
#[repr(i32)]
pub enum Facility {
  Local5 = libc::LOG_LOCAL5,
  Local6 = libc::LOG_LOCAL6,
}

/// `openlog` option bits.
#[derive(Copy, Clone, Debug, Default)]
pub struct Options(libc::c_int);

impl Options {
  /// Log the pid with each message.
  pub const PID: Self = Self(libc::LOG_PID);
  /// Log to the console if the log daemon is unreachable.
  pub const CONS: Self = Self(libc::LOG_CONS);
}

impl std::ops::BitOr for Options {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    Self(self.0 | rhs.0)
  }
}

#[derive(Copy, Clone, Debug)]
#[repr(i32)]
pub enum Priority {
  Info = libc::LOG_INFO,
  Warning = libc::LOG_WARNING,
  Err = libc::LOG_ERR,
}

static IDENT: OnceLock<CString> = OnceLock::new();

/// Opens the process syslog channel. Later calls keep the first ident.
pub fn open(ident: &str, opts: Options, facility: Facility) {
  let ident = IDENT.get_or_init(|| CString::new(ident).unwrap_or_default());
  unsafe { libc::openlog(ident.as_ptr(), opts.0, facility as i32) }
}

/// Sends one line to syslog. Messages with interior NULs are dropped rather
/// than truncated silently by the C side.
pub fn log(priority: Priority, msg: &str) {
  let Ok(c) = CString::new(msg) else {
    return;
  };
  unsafe { libc::syslog(priority as i32, c"%s".as_ptr(), c.as_ptr()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn options_combine_bitwise() {
    let opts = Options::PID | Options::CONS;
    assert_eq!(opts.0, libc::LOG_PID | libc::LOG_CONS);
  }

  #[test]
  fn interior_nul_is_dropped_without_panic() {
    log(Priority::Info, "bad\0message");
  }
}
