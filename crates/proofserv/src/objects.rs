//! Polymorphic payloads for `OBJECT` messages.
//!
//! Object bodies travel as a `u16` big-endian class id followed by a
//! `bincode`-encoded body. The class id registry is stable across releases;
//! an unknown id decodes to a protocol error that the dispatcher reports and
//! discards without tearing the session down.

use crate::protocol::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const CLASS_HISTOGRAM: u16 = 1;
pub const CLASS_NOTE: u16 = 2;

/// A filled histogram shipped between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
  pub name: String,
  pub bins: Vec<f64>,
  pub entries: i64,
}

/// A named free-form text value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  pub name: String,
  pub text: String,
}

/// Tagged variants the object registry knows how to move over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireObject {
  Histogram(Histogram),
  Note(Note),
}

impl WireObject {
  pub fn name(&self) -> &str {
    match self {
      WireObject::Histogram(h) => &h.name,
      WireObject::Note(n) => &n.name,
    }
  }

  fn class_id(&self) -> u16 {
    match self {
      WireObject::Histogram(_) => CLASS_HISTOGRAM,
      WireObject::Note(_) => CLASS_NOTE,
    }
  }
}

pub fn encode_object(obj: &WireObject) -> Result<Vec<u8>, ProtocolError> {
  let body = match obj {
    WireObject::Histogram(h) => bincode::serde::encode_to_vec(h, bincode::config::standard()),
    WireObject::Note(n) => bincode::serde::encode_to_vec(n, bincode::config::standard()),
  }
  .map_err(|e| ProtocolError::BadObject(e.to_string()))?;
  let mut out = BytesMut::with_capacity(2 + body.len());
  out.put_u16(obj.class_id());
  out.put_slice(&body);
  Ok(out.to_vec())
}

pub fn decode_object(mut bytes: &[u8]) -> Result<WireObject, ProtocolError> {
  if bytes.remaining() < 2 {
    return Err(ProtocolError::Truncated("object class id"));
  }
  let class = bytes.get_u16();
  match class {
    CLASS_HISTOGRAM => {
      let (h, _): (Histogram, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
          .map_err(|e| ProtocolError::BadObject(e.to_string()))?;
      Ok(WireObject::Histogram(h))
    }
    CLASS_NOTE => {
      let (n, _): (Note, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
          .map_err(|e| ProtocolError::BadObject(e.to_string()))?;
      Ok(WireObject::Note(n))
    }
    other => Err(ProtocolError::UnknownClass(other)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn histogram_roundtrips_through_registry() {
    let obj = WireObject::Histogram(Histogram {
      name: "hpx".to_string(),
      bins: vec![0.0, 2.0, 5.0, 1.0],
      entries: 8,
    });
    let bytes = encode_object(&obj).unwrap();
    assert_eq!(decode_object(&bytes).unwrap(), obj);
  }

  #[test]
  fn unknown_class_id_is_reported_not_fatal() {
    let mut bytes = vec![0xff, 0x7f];
    bytes.extend_from_slice(b"junk");
    let err = decode_object(&bytes).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownClass(0x7fff)));
  }
}
