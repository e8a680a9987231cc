//! Wire protocol: framed, tagged messages on the control connection.
//!
//! Every frame is `u32` big-endian length, then a `u16` big-endian tag, then
//! the payload. The length covers the tag and the payload. Payloads are typed
//! streams of big-endian primitives and `u32`-length-prefixed UTF-8 strings,
//! written and consumed in order by the handlers.
//!
//! The tag space is additive-disjoint; `ACK_BIT` may be OR-ed onto a tag by a
//! sender that wants delivery confirmation. Framing itself is the
//! acknowledgement, so receivers only strip and record the bit.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};
use thiserror::Error;

/// Bit OR-ed onto a tag to request acknowledgement.
pub const ACK_BIT: u16 = 0x8000;

/// Urgent byte code for a hard interrupt (flush both streams).
pub const OOB_HARD_INTERRUPT: u8 = 0x01;
/// Urgent byte code for a soft interrupt (cooperative flag).
pub const OOB_SOFT_INTERRUPT: u8 = 0x02;
/// Urgent byte code for a shutdown interrupt (terminate now).
pub const OOB_SHUTDOWN: u8 = 0x03;

/// Message tags understood by the dispatcher.
///
/// Values are part of the wire contract between masters and workers and must
/// not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
  /// Command string for the evaluator.
  Cint = 1,
  /// Free-form diagnostic string.
  String = 2,
  /// Polymorphic object (see `objects`).
  Object = 3,
  /// Role-dependent session handshake, exchanged once after the greeting.
  Handshake = 4,
  /// Group ordinal and size, as `"<id> <size>"`.
  GroupView = 10,
  /// Log verbosity as a decimal string.
  LogLevel = 11,
  /// Liveness probe.
  Ping = 12,
  /// Status line request.
  Print = 13,
  /// Workspace reset request carrying a directory.
  Reset = 14,
  /// Session counters request.
  Status = 15,
  /// Orderly stop request.
  Stop = 16,
  /// Dataset tuning, as `"<name> <max-virtual> <estimate>"`.
  TreeDraw = 17,
  /// File upload announcement, as `"<name> <binary?> <size>"`.
  SendFile = 18,
  /// Remote file open request `{class, filename, options}`.
  OpenFile = 19,
  /// Fan-out width change carrying a node count.
  Parallel = 20,
  /// Object fetch by `"name;cycle"`.
  GetObject = 21,
  /// Next packet request (no payload).
  GetPacket = 22,
  /// Histogram axis limits exchange.
  Limits = 23,
  /// Log chunk announcement carrying the byte count that follows raw.
  LogFile = 24,
  /// Log terminator `{status, participants}`.
  LogDone = 25,
  /// Fatal error notification from the error reporter.
  Fatal = 26,
}

impl Tag {
  /// Maps a raw wire value (ACK bit already stripped) onto a tag.
  pub fn from_raw(raw: u16) -> Option<Tag> {
    use Tag::*;
    Some(match raw {
      1 => Cint,
      2 => String,
      3 => Object,
      4 => Handshake,
      10 => GroupView,
      11 => LogLevel,
      12 => Ping,
      13 => Print,
      14 => Reset,
      15 => Status,
      16 => Stop,
      17 => TreeDraw,
      18 => SendFile,
      19 => OpenFile,
      20 => Parallel,
      21 => GetObject,
      22 => GetPacket,
      23 => Limits,
      24 => LogFile,
      25 => LogDone,
      26 => Fatal,
      _ => return None,
    })
  }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("payload truncated while reading {0}")]
  Truncated(&'static str),
  #[error("payload string is not valid utf-8")]
  BadString,
  #[error("unknown object class id {0}")]
  UnknownClass(u16),
  #[error("malformed object body: {0}")]
  BadObject(String),
}

/// One framed message: raw tag plus a payload consumed front-to-back.
///
/// Writers append primitives with the `put_*` methods; readers consume them in
/// the same order with the `get_*` methods. The payload is a cursor, so a
/// message is either being built or being drained, never both.
#[derive(Debug, Clone)]
pub struct Message {
  what: u16,
  payload: BytesMut,
}

impl Message {
  pub fn new(tag: Tag) -> Self {
    Self {
      what: tag as u16,
      payload: BytesMut::new(),
    }
  }

  /// Builds a message whose payload is a single string.
  pub fn with_str(tag: Tag, s: &str) -> Self {
    let mut m = Self::new(tag);
    m.put_str(s);
    m
  }

  fn from_wire(what: u16, payload: BytesMut) -> Self {
    Self { what, payload }
  }

  /// The tag, if the raw value is known; `None` surfaces a protocol error to
  /// the dispatcher without tearing the session down.
  pub fn tag(&self) -> Option<Tag> {
    Tag::from_raw(self.what & !ACK_BIT)
  }

  /// Raw tag value with the ACK bit stripped.
  pub fn raw_tag(&self) -> u16 {
    self.what & !ACK_BIT
  }

  pub fn wants_ack(&self) -> bool {
    self.what & ACK_BIT != 0
  }

  /// Marks the message as requesting acknowledgement.
  pub fn with_ack(mut self) -> Self {
    self.what |= ACK_BIT;
    self
  }

  pub fn payload_len(&self) -> usize {
    self.payload.len()
  }

  pub fn put_i16(&mut self, v: i16) {
    self.payload.put_i16(v);
  }

  pub fn put_i32(&mut self, v: i32) {
    self.payload.put_i32(v);
  }

  pub fn put_i64(&mut self, v: i64) {
    self.payload.put_i64(v);
  }

  pub fn put_f64(&mut self, v: f64) {
    self.payload.put_f64(v);
  }

  pub fn put_str(&mut self, s: &str) {
    self.payload.put_u32(s.len() as u32);
    self.payload.put_slice(s.as_bytes());
  }

  /// Length-prefixed raw bytes, for payloads that are not UTF-8 (the
  /// obfuscated handshake secret).
  pub fn put_blob(&mut self, b: &[u8]) {
    self.payload.put_u32(b.len() as u32);
    self.payload.put_slice(b);
  }

  pub fn put_bytes(&mut self, b: &[u8]) {
    self.payload.put_slice(b);
  }

  pub fn get_i16(&mut self) -> Result<i16, ProtocolError> {
    if self.payload.remaining() < 2 {
      return Err(ProtocolError::Truncated("i16"));
    }
    Ok(self.payload.get_i16())
  }

  pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
    if self.payload.remaining() < 4 {
      return Err(ProtocolError::Truncated("i32"));
    }
    Ok(self.payload.get_i32())
  }

  pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
    if self.payload.remaining() < 8 {
      return Err(ProtocolError::Truncated("i64"));
    }
    Ok(self.payload.get_i64())
  }

  pub fn get_f64(&mut self) -> Result<f64, ProtocolError> {
    if self.payload.remaining() < 8 {
      return Err(ProtocolError::Truncated("f64"));
    }
    Ok(self.payload.get_f64())
  }

  pub fn get_str(&mut self) -> Result<String, ProtocolError> {
    if self.payload.remaining() < 4 {
      return Err(ProtocolError::Truncated("string length"));
    }
    let len = self.payload.get_u32() as usize;
    if self.payload.remaining() < len {
      return Err(ProtocolError::Truncated("string bytes"));
    }
    let bytes = self.payload.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::BadString)
  }

  pub fn get_blob(&mut self) -> Result<Vec<u8>, ProtocolError> {
    if self.payload.remaining() < 4 {
      return Err(ProtocolError::Truncated("blob length"));
    }
    let len = self.payload.get_u32() as usize;
    if self.payload.remaining() < len {
      return Err(ProtocolError::Truncated("blob bytes"));
    }
    Ok(self.payload.split_to(len).to_vec())
  }

  /// Takes the remaining payload bytes without interpretation.
  pub fn take_rest(&mut self) -> BytesMut {
    self.payload.split()
  }
}

/// Writes one framed message. Blocking; partial writes are retried by
/// `write_all` until the whole frame is on the wire.
pub fn write_frame<W: Write>(mut w: W, msg: &Message) -> std::io::Result<()> {
  let len = 2 + msg.payload.len() as u32;
  w.write_all(&len.to_be_bytes())?;
  w.write_all(&msg.what.to_be_bytes())?;
  w.write_all(&msg.payload)?;
  w.flush()
}

/// Reads exactly one framed message. Peer close surfaces as
/// `ErrorKind::UnexpectedEof`, which callers treat as peer loss.
pub fn read_frame<R: Read>(mut r: R) -> std::io::Result<Message> {
  let mut hdr = [0u8; 4];
  r.read_exact(&mut hdr)?;
  let len = u32::from_be_bytes(hdr) as usize;
  if len < 2 {
    return Err(std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      "frame shorter than its tag",
    ));
  }
  let mut what = [0u8; 2];
  r.read_exact(&mut what)?;
  let mut payload = vec![0u8; len - 2];
  r.read_exact(&mut payload)?;
  Ok(Message::from_wire(
    u16::from_be_bytes(what),
    BytesMut::from(&payload[..]),
  ))
}

/// De-obfuscates a handshake secret in place (bitwise NOT of each byte).
pub fn deobfuscate_secret(secret: &mut [u8]) {
  for b in secret.iter_mut() {
    *b = !*b;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn primitives_roundtrip_in_order() {
    let mut m = Message::new(Tag::Status);
    m.put_i64(123_456_789);
    m.put_f64(1.5);
    m.put_f64(0.25);
    m.put_str("/home/user/proof");

    let mut buf = Vec::new();
    write_frame(&mut buf, &m).unwrap();
    let mut out = read_frame(&buf[..]).unwrap();

    assert_eq!(out.tag(), Some(Tag::Status));
    assert!(!out.wants_ack());
    assert_eq!(out.get_i64().unwrap(), 123_456_789);
    assert_eq!(out.get_f64().unwrap(), 1.5);
    assert_eq!(out.get_f64().unwrap(), 0.25);
    assert_eq!(out.get_str().unwrap(), "/home/user/proof");
  }

  #[test]
  fn ack_bit_is_stripped_but_remembered() {
    let m = Message::new(Tag::Ping).with_ack();
    let mut buf = Vec::new();
    write_frame(&mut buf, &m).unwrap();
    let out = read_frame(&buf[..]).unwrap();
    assert_eq!(out.tag(), Some(Tag::Ping));
    assert!(out.wants_ack());
  }

  #[test]
  fn unknown_tag_is_preserved_not_fatal() {
    let m = Message::from_wire(999, BytesMut::new());
    let mut buf = Vec::new();
    write_frame(&mut buf, &m).unwrap();
    let out = read_frame(&buf[..]).unwrap();
    assert_eq!(out.tag(), None);
    assert_eq!(out.raw_tag(), 999);
  }

  #[test]
  fn truncated_payload_reports_which_field() {
    let mut m = Message::new(Tag::LogDone);
    m.put_i32(0);
    let mut buf = Vec::new();
    write_frame(&mut buf, &m).unwrap();
    let mut out = read_frame(&buf[..]).unwrap();
    out.get_i32().unwrap();
    let err = out.get_i32().unwrap_err();
    assert!(matches!(err, ProtocolError::Truncated("i32")));
  }

  #[test]
  fn eof_surfaces_as_unexpected_eof() {
    let err = read_frame(&[][..]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
  }

  #[test]
  fn secret_deobfuscation_is_bitwise_not() {
    let mut secret: Vec<u8> = "hunter2".bytes().map(|b| !b).collect();
    deobfuscate_secret(&mut secret);
    assert_eq!(secret, b"hunter2");
  }

  #[test]
  fn obfuscated_secrets_survive_as_blobs() {
    // NOT of ASCII is not valid UTF-8, so the secret travels as a blob.
    let obfuscated: Vec<u8> = "hunter2".bytes().map(|b| !b).collect();
    let mut m = Message::new(Tag::Handshake);
    m.put_str("alice");
    m.put_blob(&obfuscated);

    let mut buf = Vec::new();
    write_frame(&mut buf, &m).unwrap();
    let mut out = read_frame(&buf[..]).unwrap();
    assert_eq!(out.get_str().unwrap(), "alice");
    let mut blob = out.get_blob().unwrap();
    deobfuscate_secret(&mut blob);
    assert_eq!(blob, b"hunter2");
  }
}
