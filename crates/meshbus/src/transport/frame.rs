// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP frame codec and reassembly.
//!
//! One frame is an outer `u32` little-endian length followed by the
//! body; the body is a sequence of parts, each a `u32` little-endian
//! length plus bytes. Data frames carry three parts (topic, sender
//! data address, payload); control frames carry four or more (see the
//! runtime's dispatch).
//!
//! [`FrameBuf`] reassembles frames from non-blocking reads: feed it
//! whatever the socket produced, pop complete frame bodies.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{Error, Result};

/// Encode parts into one framed message.
pub fn encode_frame(parts: &[&[u8]]) -> Vec<u8> {
    let body_len: usize = parts.iter().map(|p| 4 + p.len()).sum();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_le_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Split a frame body back into its parts.
pub fn decode_parts(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut parts = Vec::new();
    let mut off = 0usize;
    while off < body.len() {
        if off + 4 > body.len() {
            return Err(Error::FrameParseError("truncated part length".to_string()));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&body[off..off + 4]);
        let len = u32::from_le_bytes(raw) as usize;
        off += 4;
        if off + len > body.len() {
            return Err(Error::FrameParseError(format!(
                "part of {} bytes overruns body of {}",
                len,
                body.len()
            )));
        }
        parts.push(body[off..off + len].to_vec());
        off += len;
    }
    Ok(parts)
}

/// Interpret one part as UTF-8.
pub fn part_str(part: &[u8]) -> Result<&str> {
    std::str::from_utf8(part).map_err(|e| Error::FrameParseError(format!("non-UTF-8 part: {}", e)))
}

/// Build a data frame: topic, sender data address, payload.
pub fn data_frame(topic: &str, sender_addr: &str, payload: &[u8]) -> Vec<u8> {
    encode_frame(&[topic.as_bytes(), sender_addr.as_bytes(), payload])
}

/// Per-connection reassembly buffer for non-blocking reads.
#[derive(Debug, Default)]
pub struct FrameBuf {
    buf: Vec<u8>,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, if one is buffered.
    ///
    /// # Errors
    ///
    /// An oversized length prefix means the stream is corrupt; the
    /// caller must drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[..4]);
        let body_len = u32::from_le_bytes(raw) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(Error::FrameParseError(format!(
                "frame of {} bytes exceeds limit",
                body_len
            )));
        }
        if self.buf.len() < 4 + body_len {
            return Ok(None);
        }
        let body = self.buf[4..4 + body_len].to_vec();
        self.buf.drain(..4 + body_len);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(&[b"/topic", b"10.0.0.1:4242", b"payload bytes"]);
        let mut buf = FrameBuf::new();
        buf.extend(&frame);

        let body = buf
            .next_frame()
            .expect("well-formed frame")
            .expect("one complete frame buffered");
        let parts = decode_parts(&body).expect("parts should decode");
        assert_eq!(parts.len(), 3);
        assert_eq!(part_str(&parts[0]).expect("utf8"), "/topic");
        assert_eq!(parts[2], b"payload bytes");

        assert!(buf.next_frame().expect("no error").is_none());
    }

    #[test]
    fn reassembles_across_split_reads() {
        let frame = data_frame("/t", "a:1", &[9u8; 100]);
        let mut buf = FrameBuf::new();

        // Feed one byte at a time; the frame completes only at the end.
        for (i, byte) in frame.iter().enumerate() {
            buf.extend(std::slice::from_ref(byte));
            let got = buf.next_frame().expect("no error");
            if i + 1 < frame.len() {
                assert!(got.is_none());
            } else {
                let parts = decode_parts(&got.expect("complete")).expect("parts");
                assert_eq!(parts[2].len(), 100);
            }
        }
    }

    #[test]
    fn two_frames_in_one_read() {
        let f1 = data_frame("/a", "x:1", b"one");
        let f2 = data_frame("/b", "x:1", b"two");
        let mut buf = FrameBuf::new();
        let mut joined = f1.clone();
        joined.extend_from_slice(&f2);
        buf.extend(&joined);

        let b1 = buf.next_frame().expect("ok").expect("first frame");
        let b2 = buf.next_frame().expect("ok").expect("second frame");
        assert!(buf.next_frame().expect("ok").is_none());
        assert_eq!(decode_parts(&b1).expect("parts")[2], b"one");
        assert_eq!(decode_parts(&b2).expect("parts")[2], b"two");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = FrameBuf::new();
        buf.extend(&(u32::MAX).to_le_bytes());
        assert!(buf.next_frame().is_err());
    }

    #[test]
    fn corrupt_parts_are_rejected() {
        // part length claims more bytes than the body holds
        let mut body = Vec::new();
        body.extend_from_slice(&10u32.to_le_bytes());
        body.extend_from_slice(b"abc");
        assert!(decode_parts(&body).is_err());

        // truncated length prefix
        assert!(decode_parts(&[1, 2]).is_err());
    }

    #[test]
    fn empty_parts_survive() {
        let frame = encode_frame(&[b"", b"", b""]);
        let mut buf = FrameBuf::new();
        buf.extend(&frame);
        let body = buf.next_frame().expect("ok").expect("frame");
        let parts = decode_parts(&body).expect("parts");
        assert_eq!(parts, vec![Vec::new(), Vec::new(), Vec::new()]);
    }
}
