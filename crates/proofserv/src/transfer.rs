//! File receiver for `SENDFILE` uploads.
//!
//! The peer announces `{name, binary?, size}` and then streams exactly
//! `size` raw bytes. Text files get every `\r` stripped so scripts written
//! on Windows run unmodified. The file is created private (0600) and only
//! published as 0644 once the transfer completed.

use crate::reporter;
use crate::socket::CtrlSocket;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const RECV_BUF: usize = 16 * 1024;

/// Receives one announced file. Failures are reported and returned; the
/// session continues either way.
pub fn receive_file(
  sock: &CtrlSocket,
  path: &Path,
  binary: bool,
  size: i64,
) -> std::io::Result<()> {
  let mut file = match OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .mode(0o600)
    .open(path)
  {
    Ok(f) => f,
    Err(e) => {
      reporter::sys_report_returning(
        "receive_file",
        &format!("error opening file {}", path.display()),
        &e,
      );
      return Err(e);
    }
  };

  let mut buf = [0u8; RECV_BUF];
  let mut received: i64 = 0;
  while received < size {
    let left = ((size - received) as usize).min(RECV_BUF);
    let n = match sock.recv_raw(&mut buf[..left], false) {
      Ok(0) => {
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        reporter::sys_report_returning(
          "receive_file",
          &format!("peer closed while receiving {}", path.display()),
          &e,
        );
        return Err(e);
      }
      Ok(n) => n,
      Err(e) => {
        reporter::sys_report_returning(
          "receive_file",
          &format!("error receiving {}", path.display()),
          &e,
        );
        return Err(e);
      }
    };
    received += n as i64;

    let chunk = &buf[..n];
    let result = if binary {
      file.write_all(chunk)
    } else {
      let stripped: Vec<u8> = chunk.iter().copied().filter(|&b| b != b'\r').collect();
      file.write_all(&stripped)
    };
    if let Err(e) = result {
      reporter::sys_report_returning(
        "receive_file",
        &format!("error writing to {}", path.display()),
        &e,
      );
      return Err(e);
    }
  }

  drop(file);
  std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(0o644))?;
  Ok(())
}
