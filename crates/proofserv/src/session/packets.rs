//! Worker-side clients for the master's coordination services: the packet
//! cursor, object fetch and histogram limits.
//!
//! All three are strict request/response exchanges on the control
//! connection; at most one request is ever outstanding. A pending urgent
//! byte aborts the exchange before a new request is sent, so interrupts are
//! honored at packet boundaries.

use crate::eval::{AxisLimits, MasterLink, Packet};
use crate::event::SignalFlags;
use crate::objects::{WireObject, decode_object};
use crate::protocol::{Message, Tag};
use crate::socket::CtrlSocket;
use anyhow::{Context, Result, bail};

pub struct RemoteLink<'a> {
  sock: &'a mut CtrlSocket,
  /// Session packet cursor: entries processed so far, per the master.
  processed: &'a mut i64,
  signals: &'a SignalFlags,
}

impl<'a> RemoteLink<'a> {
  pub fn new(
    sock: &'a mut CtrlSocket,
    processed: &'a mut i64,
    signals: &'a SignalFlags,
  ) -> Self {
    Self {
      sock,
      processed,
      signals,
    }
  }
}

impl MasterLink for RemoteLink<'_> {
  fn next_packet(&mut self, _total_entries: i64) -> Result<Option<Packet>> {
    if self.signals.urgent_pending() {
      bail!("interrupted while requesting the next packet");
    }
    self
      .sock
      .send(&Message::new(Tag::GetPacket))
      .context("request next packet")?;
    let mut reply = self.sock.recv().context("read packet assignment")?;
    let count = reply.get_i32()?;
    let first = reply.get_i64()?;
    *self.processed = reply.get_i64()?;
    if count == -1 {
      return Ok(None);
    }
    Ok(Some(Packet {
      first,
      count: count as i64,
    }))
  }

  fn fetch_object(&mut self, namecycle: &str) -> Result<Option<WireObject>> {
    self
      .sock
      .send(&Message::with_str(Tag::GetObject, namecycle))
      .context("request object")?;
    let mut reply = self.sock.recv().context("read object reply")?;
    if reply.payload_len() == 0 {
      // Empty reply on miss.
      return Ok(None);
    }
    Ok(Some(decode_object(&reply.take_rest())?))
  }

  fn fetch_limits(&mut self, n: i64, axes: &mut [AxisLimits]) -> Result<()> {
    let mut request = Message::new(Tag::Limits);
    request.put_i32(axes.len() as i32);
    request.put_i64(n);
    for axis in axes.iter() {
      request.put_i32(axis.bins);
      request.put_f64(axis.vmin);
      request.put_f64(axis.vmax);
    }
    self.sock.send(&request).context("request axis limits")?;

    let mut reply = self.sock.recv().context("read axis limits")?;
    for axis in axes.iter_mut() {
      axis.bins = reply.get_i32()?;
      axis.vmin = reply.get_f64()?;
      axis.vmax = reply.get_f64()?;
    }
    Ok(())
  }
}
