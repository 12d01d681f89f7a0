// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in message types.
//!
//! Fixed-width fields are little-endian. These are the payloads the
//! test suite and the benchmark use; applications are free to bring
//! their own [`Payload`] implementations.

use crate::error::{Error, Result};
use crate::payload::Payload;

/// The canonical empty message, used by no-input and no-output
/// service shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

impl Payload for Empty {
    fn type_name() -> &'static str {
        "meshbus.msgs.Empty"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            Ok(Empty)
        } else {
            Err(Error::DecodeError(format!(
                "Empty payload carries {} stray bytes",
                bytes.len()
            )))
        }
    }
}

/// A single 32-bit signed integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Int32 {
    pub data: i32,
}

impl Int32 {
    pub fn new(data: i32) -> Self {
        Self { data }
    }
}

impl Payload for Int32 {
    fn type_name() -> &'static str {
        "meshbus.msgs.Int32"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.data.to_le_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::DecodeError(format!("Int32 expects 4 bytes, got {}", bytes.len())))?;
        Ok(Self {
            data: i32::from_le_bytes(raw),
        })
    }
}

/// A 3-component double-precision vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Payload for Vector3d {
    fn type_name() -> &'static str {
        "meshbus.msgs.Vector3d"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.y.to_le_bytes());
        out.extend_from_slice(&self.z.to_le_bytes());
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 24 {
            return Err(Error::DecodeError(format!(
                "Vector3d expects 24 bytes, got {}",
                bytes.len()
            )));
        }
        let field = |i: usize| -> f64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            f64::from_le_bytes(raw)
        };
        Ok(Self {
            x: field(0),
            y: field(1),
            z: field(2),
        })
    }
}

/// A UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Text {
    pub data: String,
}

impl Text {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl Payload for Text {
    fn type_name() -> &'static str {
        "meshbus.msgs.Text"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.data.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let data = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::DecodeError(format!("Text is not UTF-8: {}", e)))?;
        Ok(Self { data })
    }
}

/// An opaque byte buffer; the benchmark's payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// A zero-filled blob of the given size.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }
}

impl Payload for Blob {
    fn type_name() -> &'static str {
        "meshbus.msgs.Blob"
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            data: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_round_trip_and_length_check() {
        let msg = Int32::new(-77);
        let bytes = msg.encode().expect("encode should succeed");
        assert_eq!(bytes.len(), 4);
        assert_eq!(Int32::decode(&bytes).expect("decode should succeed"), msg);
        assert!(Int32::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn vector3d_round_trip() {
        let v = Vector3d {
            x: 1.5,
            y: -2.0,
            z: 1e300,
        };
        let bytes = v.encode().expect("encode should succeed");
        assert_eq!(Vector3d::decode(&bytes).expect("decode should succeed"), v);
        assert!(Vector3d::decode(&bytes[..16]).is_err());
    }

    #[test]
    fn empty_rejects_payload_bytes() {
        assert!(Empty::decode(&[]).is_ok());
        assert!(Empty::decode(&[1]).is_err());
    }

    #[test]
    fn descriptors_are_distinct() {
        assert_ne!(Int32::type_name(), Vector3d::type_name());
        assert_ne!(Empty::type_name(), Blob::type_name());
    }

    #[test]
    fn text_rejects_invalid_utf8() {
        assert!(Text::decode(&[0xff, 0xfe]).is_err());
        let t = Text::new("hola");
        let bytes = t.encode().expect("encode should succeed");
        assert_eq!(Text::decode(&bytes).expect("decode should succeed"), t);
    }
}
