//! Control socket: blocking framed I/O plus the raw and urgent-data surface.
//!
//! A `CtrlSocket` wraps the duplex stream a session inherited from its
//! launcher (or dialed toward a worker). It offers:
//! - blocking `send`/`recv` of framed [`Message`]s,
//! - raw byte I/O with an optional urgent (OOB) flag,
//! - the two socket-level queries the interrupt handler needs
//!   (bytes-available and at-mark),
//! - the session socket options (keep-alive, no-delay, urgent-signal owner).
//!
//! Raw reads and writes retry on `EINTR`; an urgent read with no urgent byte
//! pending surfaces as `ErrorKind::WouldBlock` so the handler can run its
//! drain-before-retry dance.

use crate::protocol::{Message, read_frame, write_frame};
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

pub struct CtrlSocket {
  fd: OwnedFd,
}

// Not exposed by the `libc` crate for this target; value matches
// <bits/ioctls.h> / asm-generic/sockios.h on Linux.
#[cfg(target_os = "linux")]
const SIOCATMARK: libc::c_ulong = 0x8905;
#[cfg(not(target_os = "linux"))]
use libc::SIOCATMARK;

fn cvt(ret: isize) -> io::Result<usize> {
  if ret < 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(ret as usize)
  }
}

impl CtrlSocket {
  /// Adopts the already-connected descriptor inherited from the launching
  /// daemon (descriptor 0 by contract).
  ///
  /// # Safety
  /// The caller must own `fd` and it must stay unused elsewhere.
  pub unsafe fn from_inherited(fd: RawFd) -> Self {
    Self {
      fd: unsafe { OwnedFd::from_raw_fd(fd) },
    }
  }

  pub fn from_tcp(stream: TcpStream) -> Self {
    Self {
      fd: OwnedFd::from(stream),
    }
  }

  pub fn from_unix(stream: UnixStream) -> Self {
    Self {
      fd: OwnedFd::from(stream),
    }
  }

  pub fn as_raw_fd(&self) -> RawFd {
    self.fd.as_raw_fd()
  }

  pub fn as_fd(&self) -> BorrowedFd<'_> {
    self.fd.as_fd()
  }

  /// Sends one framed message, blocking until fully written.
  pub fn send(&mut self, msg: &Message) -> io::Result<()> {
    write_frame(&mut *self, msg)
  }

  /// Receives exactly one framed message, blocking. Peer close surfaces as
  /// `ErrorKind::UnexpectedEof`.
  pub fn recv(&mut self) -> io::Result<Message> {
    read_frame(&mut *self)
  }

  /// Sends raw bytes, optionally as urgent data. Blocks until the whole
  /// buffer is written, retrying partial sends.
  pub fn send_raw(&self, buf: &[u8], urgent: bool) -> io::Result<usize> {
    let flags = if urgent { libc::MSG_OOB } else { 0 };
    let mut sent = 0;
    while sent < buf.len() {
      let n = unsafe {
        libc::send(
          self.fd.as_raw_fd(),
          buf[sent..].as_ptr().cast(),
          buf.len() - sent,
          flags,
        )
      };
      if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
          continue;
        }
        return Err(err);
      }
      sent += n as usize;
    }
    Ok(sent)
  }

  /// Receives raw bytes, optionally from the urgent channel.
  ///
  /// An urgent read with no urgent byte queued returns `WouldBlock`; some
  /// platforms report that condition as `EINVAL`, which is normalized here.
  pub fn recv_raw(&self, buf: &mut [u8], urgent: bool) -> io::Result<usize> {
    let flags = if urgent { libc::MSG_OOB } else { 0 };
    loop {
      let n = unsafe {
        libc::recv(
          self.fd.as_raw_fd(),
          buf.as_mut_ptr().cast(),
          buf.len(),
          flags,
        )
      };
      if n >= 0 {
        return Ok(n as usize);
      }
      let err = io::Error::last_os_error();
      let errno = err.raw_os_error().unwrap_or(0);
      if errno == libc::EINTR {
        continue;
      }
      if urgent && (errno == libc::EAGAIN || errno == libc::EINVAL) {
        return Err(ErrorKind::WouldBlock.into());
      }
      return Err(err);
    }
  }

  /// Number of bytes queued for reading (FIONREAD).
  pub fn bytes_to_read(&self) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    cvt(unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::FIONREAD, &mut n) } as isize)?;
    Ok(n.max(0) as usize)
  }

  /// Whether the read cursor sits at the urgent-byte mark (SIOCATMARK).
  pub fn at_mark(&self) -> io::Result<bool> {
    let mut n: libc::c_int = 0;
    cvt(unsafe { libc::ioctl(self.fd.as_raw_fd(), SIOCATMARK, &mut n) } as isize)?;
    Ok(n != 0)
  }

  /// Checks liveness of the peer every couple of hours.
  pub fn set_keep_alive(&self) -> io::Result<()> {
    self.set_int_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
  }

  /// Ships small frames immediately to cut command latency. Only meaningful
  /// on TCP transports; callers ignore the error elsewhere.
  pub fn set_no_delay(&self) -> io::Result<()> {
    self.set_int_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
  }

  fn set_int_option(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    cvt(unsafe {
      libc::setsockopt(
        self.fd.as_raw_fd(),
        level,
        name,
        (&raw const value).cast(),
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
      )
    } as isize)?;
    Ok(())
  }

  /// Directs the urgent-data signal (SIGURG) at the given process.
  pub fn set_owner_process(&self, pid: i32) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETOWN, pid) } as isize)?;
    Ok(())
  }

  /// Moves the socket off the stdio descriptor range so 0/1/2 become free
  /// for the log redirection. The original low descriptor is closed.
  pub fn rebind_above_stdio(&mut self) -> io::Result<()> {
    if self.fd.as_raw_fd() > 2 {
      return Ok(());
    }
    let mut kept = self.fd.try_clone()?;
    let mut low = Vec::new();
    while kept.as_raw_fd() <= 2 {
      let next = kept.try_clone()?;
      low.push(kept);
      kept = next;
    }
    drop(low);
    self.fd = kept;
    Ok(())
  }
}

impl Read for CtrlSocket {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self.recv_raw(buf, false)? {
      0 => Err(ErrorKind::UnexpectedEof.into()),
      n => Ok(n),
    }
  }
}

impl Write for CtrlSocket {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.send_raw(buf, false)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{OOB_HARD_INTERRUPT, Tag};
  use std::net::TcpListener;
  use std::time::Duration;

  fn tcp_pair() -> (CtrlSocket, CtrlSocket) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let a = TcpStream::connect(addr).unwrap();
    let (b, _) = listener.accept().unwrap();
    (CtrlSocket::from_tcp(a), CtrlSocket::from_tcp(b))
  }

  #[test]
  fn framed_messages_roundtrip_over_socketpair() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut tx = CtrlSocket::from_unix(a);
    let mut rx = CtrlSocket::from_unix(b);

    let mut m = Message::new(Tag::LogDone);
    m.put_i32(0);
    m.put_i32(3);
    tx.send(&m).unwrap();

    let mut got = rx.recv().unwrap();
    assert_eq!(got.tag(), Some(Tag::LogDone));
    assert_eq!(got.get_i32().unwrap(), 0);
    assert_eq!(got.get_i32().unwrap(), 3);
  }

  #[test]
  fn recv_reports_peer_close_as_eof() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut rx = CtrlSocket::from_unix(a);
    drop(CtrlSocket::from_unix(b));
    let err = rx.recv().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
  }

  #[test]
  fn urgent_read_with_empty_queue_would_block() {
    let (a, _b) = tcp_pair();
    let mut byte = [0u8; 1];
    let err = a.recv_raw(&mut byte, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
  }

  #[test]
  fn urgent_byte_is_seen_after_draining_to_the_mark() {
    let (tx, rx) = tcp_pair();
    tx.send_raw(b"abc", false).unwrap();
    tx.send_raw(&[OOB_HARD_INTERRUPT], true).unwrap();

    // Wait for the regular bytes to land, then drain them.
    let mut waited = 0;
    while rx.bytes_to_read().unwrap() < 3 && waited < 200 {
      std::thread::sleep(Duration::from_millis(10));
      waited += 1;
    }
    let mut waste = [0u8; 8];
    let n = rx.recv_raw(&mut waste, false).unwrap();
    assert_eq!(&waste[..n], b"abc");

    assert!(rx.at_mark().unwrap());
    let mut oob = [0u8; 1];
    let mut tries = 0;
    loop {
      match rx.recv_raw(&mut oob, true) {
        Ok(1) => break,
        Ok(_) | Err(_) if tries < 200 => {
          tries += 1;
          std::thread::sleep(Duration::from_millis(10));
        }
        Err(e) => panic!("urgent byte never arrived: {e}"),
        Ok(n) => panic!("unexpected urgent read of {n} bytes"),
      }
    }
    assert_eq!(oob[0], OOB_HARD_INTERRUPT);
  }

  #[test]
  fn rebind_leaves_descriptor_above_stdio() {
    let (a, _b) = UnixStream::pair().unwrap();
    let mut sock = CtrlSocket::from_unix(a);
    sock.rebind_above_stdio().unwrap();
    assert!(sock.as_raw_fd() > 2);
  }
}
