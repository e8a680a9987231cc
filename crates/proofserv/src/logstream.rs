//! Per-session log file and the post-request flush protocol.
//!
//! The write end of the log is the session's stdout/stderr (rebound with
//! `dup2` after setup), so everything the evaluator prints lands in the
//! file. The streamer keeps an independent read handle whose cursor marks
//! how far the peer has seen; after each flushing request it ships the new
//! suffix in 32 KiB chunks as raw bytes behind a `LOGFILE` header, then
//! emits the `LOGDONE` terminator the client uses as a barrier.
//!
//! Producer and consumer share the loop thread, so no locking is involved
//! and the cursor can never regress.

use crate::protocol::{Message, Tag};
use crate::reporter;
use crate::session::Role;
use crate::socket::CtrlSocket;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CHUNK: usize = 32 * 1024;

pub struct LogStream {
  path: PathBuf,
  writer: File,
  reader: File,
}

impl LogStream {
  /// Purges previous logs for this role/ordinal and opens a fresh one,
  /// returning the streamer with its read cursor at the start.
  pub fn create(log_dir: &Path, role: Role, ordinal: i32, pid: u32) -> io::Result<Self> {
    let prefix = match role {
      Role::Master => "proof_".to_string(),
      Role::Worker => format!("proofs{ordinal}_"),
    };
    purge_previous(log_dir, &prefix);

    let path = log_dir.join(format!("{prefix}{pid}.log"));
    let writer = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&path)?;
    let mut reader = File::open(&path)?;
    reader.seek(SeekFrom::Start(0))?;
    Ok(Self {
      path,
      writer,
      reader,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Direct handle on the write end, used by masters to fold collected
  /// worker output into their own log.
  pub fn writer(&mut self) -> &mut File {
    &mut self.writer
  }

  /// Rebinds descriptors 0/1/2 onto the log's write end, freeing the
  /// stdio range the control socket vacated. Descriptor 0 becomes the
  /// redirected stdout by contract.
  pub fn redirect_stdio(&self) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = self.writer.as_raw_fd();
    for target in [0, 1, 2] {
      if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(io::Error::last_os_error());
      }
    }
    Ok(())
  }

  /// Ships the unseen log suffix followed by `LOGDONE{status, participants}`.
  ///
  /// Chunk-level I/O errors are reported and abandon the body, but the
  /// terminator is still attempted so the peer's barrier resolves.
  pub fn ship(
    &mut self,
    sock: &mut CtrlSocket,
    status: i32,
    participants: i32,
  ) -> io::Result<()> {
    let _ = io::stdout().flush();
    let _ = self.writer.flush();

    let total = fs::metadata(&self.path)?.len();
    let seen = self.reader.stream_position()?;
    let mut left = total.saturating_sub(seen);

    if left > 0 {
      let mut header = Message::new(Tag::LogFile);
      header.put_i32(left.min(i32::MAX as u64) as i32);
      sock.send(&header)?;

      let mut buf = [0u8; CHUNK];
      while left > 0 {
        let want = (left as usize).min(CHUNK);
        let n = match self.reader.read(&mut buf[..want]) {
          Ok(n) => n,
          Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
          Err(e) => {
            reporter::sys_report_returning("send_log_file", "error reading log file", &e);
            break;
          }
        };
        if n == 0 {
          break;
        }
        if let Err(e) = sock.send_raw(&buf[..n], false) {
          reporter::sys_report_returning("send_log_file", "error sending log file", &e);
          break;
        }
        left -= n as u64;
      }
    }

    let mut done = Message::new(Tag::LogDone);
    done.put_i32(status);
    done.put_i32(participants);
    sock.send(&done)
  }
}

fn purge_previous(log_dir: &Path, prefix: &str) {
  let Ok(entries) = fs::read_dir(log_dir) else {
    return;
  };
  for entry in entries.flatten() {
    let name = entry.file_name();
    let Some(name) = name.to_str() else {
      continue;
    };
    if name.starts_with(prefix) && name.ends_with(".log") {
      let _ = fs::remove_file(entry.path());
    }
  }
}
