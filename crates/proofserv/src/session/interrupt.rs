//! Urgent-data and broken-pipe handling.
//!
//! Three urgent byte codes arrive out of band: hard (flush both streams),
//! soft (cooperative flag) and shutdown (terminate). Receiving the byte is
//! itself delicate: on some platforms the urgent read blocks behind queued
//! regular data, so the handler probes bytes-available, discards up to a
//! bounded waste buffer, and retries at roughly 1 Hz until the byte shows
//! up. Whether any regular data was discarded is remembered: a soft
//! interrupt that flushed the stream reports and skips the flag.

use super::{Flow, Session};
use crate::protocol::{
  Message, OOB_HARD_INTERRUPT, OOB_SHUTDOWN, OOB_SOFT_INTERRUPT, Tag,
};
use crate::reporter::{self, Severity};
use anyhow::Result;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Bounded discard buffer for the drain dance.
const WASTE_SIZE: usize = 1024;
/// Retry pause while waiting for the urgent byte or the at-mark.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

impl Session {
  /// Handles one urgent byte end to end, including the post-interrupt log
  /// shipment.
  pub(crate) fn handle_urgent_data(&mut self) -> Result<Flow> {
    let mut oob = [0u8; 1];
    let mut waste = [0u8; WASTE_SIZE];
    let mut wasted = false;

    // Receive the OOB byte, flushing regular data out of its way if the
    // platform requires that.
    loop {
      match self.socket.recv_raw(&mut oob, true) {
        Ok(1) => break,
        Ok(0) => return Ok(Flow::Exit(0)),
        Ok(_) => continue,
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
          let queued = self.socket.bytes_to_read().unwrap_or(0);
          if queued == 0 {
            std::thread::sleep(RETRY_PAUSE);
            continue;
          }
          let want = queued.min(WASTE_SIZE);
          match self.socket.recv_raw(&mut waste[..want], false) {
            Ok(n) if n > 0 => wasted = true,
            _ => {
              reporter::report(Severity::Error, "handle_urgent_data", "error receiving waste");
              return Ok(Flow::Continue);
            }
          }
        }
        Err(_) => {
          reporter::report(Severity::Error, "handle_urgent_data", "error receiving OOB");
          return Ok(Flow::Continue);
        }
      }
    }

    match oob[0] {
      OOB_HARD_INTERRUPT => {
        self.report_interrupt("Hard Interrupt");
        self.propagate_interrupt(OOB_HARD_INTERRUPT);
        self.flush_to_mark(oob[0]);
        // Consume whatever the interrupted workers still had in flight.
        if self.is_master() {
          let Session {
            fleet,
            workspace,
            log,
            ..
          } = self;
          if let Some(fleet) = fleet.as_mut() {
            fleet.drain_after_interrupt(workspace, log.writer())?;
          }
        }
      }
      OOB_SOFT_INTERRUPT => {
        self.report_interrupt("Soft Interrupt");
        self.propagate_interrupt(OOB_SOFT_INTERRUPT);
        if wasted {
          // A hard-interrupt drain already consumed stream bytes; the
          // cooperative flag is skipped in that case.
          reporter::report(
            Severity::Error,
            "handle_urgent_data",
            "soft interrupt flushed stream",
          );
        } else {
          self.interrupt.store(true, Ordering::Relaxed);
        }
      }
      OOB_SHUTDOWN => {
        self.report_interrupt("Shutdown Interrupt");
        self.propagate_interrupt(OOB_SHUTDOWN);
        return Ok(Flow::Exit(0));
      }
      other => {
        reporter::report(
          Severity::Error,
          "handle_urgent_data",
          &format!("unexpected OOB byte {other:#04x}"),
        );
      }
    }

    let _ = self.send_log(0);
    Ok(Flow::Continue)
  }

  /// Discards inbound bytes until the read cursor reaches the urgent mark,
  /// then echoes the urgent byte so the peer can align its own flush.
  fn flush_to_mark(&mut self, oob_byte: u8) {
    let mut waste = [0u8; WASTE_SIZE];
    loop {
      match self.socket.at_mark() {
        Ok(true) => {
          if self.socket.send_raw(&[oob_byte], true).is_err() {
            reporter::report(Severity::Error, "handle_urgent_data", "error sending OOB");
          }
          return;
        }
        Ok(false) => {}
        Err(e) => {
          reporter::sys_report("handle_urgent_data", "cannot query at-mark", &e);
          return;
        }
      }
      let queued = self.socket.bytes_to_read().unwrap_or(0);
      if queued == 0 {
        std::thread::sleep(RETRY_PAUSE);
        continue;
      }
      let want = queued.min(WASTE_SIZE);
      if !matches!(self.socket.recv_raw(&mut waste[..want], false), Ok(n) if n > 0) {
        reporter::report(Severity::Error, "handle_urgent_data", "error receiving waste (2)");
        return;
      }
    }
  }

  fn report_interrupt(&self, kind: &str) {
    let line = if self.is_master() {
      format!("*** Master: {kind}")
    } else {
      format!("*** Slave {}: {kind}", self.ordinal)
    };
    reporter::report(Severity::Info, "handle_urgent_data", &line);
  }

  fn propagate_interrupt(&mut self, byte: u8) {
    if let Some(fleet) = &mut self.fleet {
      fleet.interrupt(byte);
    }
  }

  /// Keep-alive failure. A master probes the client first: if the client
  /// still answers, a worker died and the session continues; if not, the
  /// workers are shut down and the session ends. Workers terminate.
  pub(crate) fn handle_sig_pipe(&mut self) -> Result<Flow> {
    if self.is_master() {
      if self.socket.send(&Message::new(Tag::Ping).with_ack()).is_err() {
        reporter::report(
          Severity::Info,
          "handle_sig_pipe",
          "Master: KeepAlive probe failed",
        );
        self.propagate_interrupt(OOB_SHUTDOWN);
        return Ok(Flow::Exit(0));
      }
      Ok(Flow::Continue)
    } else {
      reporter::report(
        Severity::Info,
        "handle_sig_pipe",
        &format!("Slave {}: KeepAlive probe failed", self.ordinal),
      );
      Ok(Flow::Exit(0))
    }
  }
}
