// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery datagram codec.
//!
//! One datagram carries exactly one message. Layout:
//!
//! ```text
//! version(u8) | kind(u8) | senderProcUuid(16)
//! ADVERTISE/UNADVERTISE: topic | dataAddr | ctrlAddr | nodeUuid(16)
//!                        | scope(u8) | reqType | repType | flavor(u8)
//! SUBSCRIBE:             topic | flavor(u8)
//! HEARTBEAT, BYE:        (header only)
//! ```
//!
//! Strings are u16 little-endian length-prefixed UTF-8. Parse failures
//! yield an error; receivers drop the datagram and continue.

use crate::config::{MAX_DISCOVERY_DATAGRAM, WIRE_VERSION};
use crate::core::guid::Uuid;
use crate::core::types::{Endpoint, Flavor, Scope};
use crate::error::{Error, Result};

const KIND_ADVERTISE: u8 = 1;
const KIND_UNADVERTISE: u8 = 2;
const KIND_SUBSCRIBE: u8 = 3;
const KIND_HEARTBEAT: u8 = 4;
const KIND_BYE: u8 = 5;

/// One discovery message, sender identity excluded (it lives in the
/// shared header).
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryMsg {
    Advertise { endpoint: Endpoint, flavor: Flavor },
    Unadvertise { endpoint: Endpoint, flavor: Flavor },
    Subscribe { topic: String, flavor: Flavor },
    Heartbeat,
    Bye,
}

/// Encode one message into a datagram.
pub fn encode(puuid: Uuid, msg: &DiscoveryMsg) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.push(WIRE_VERSION);
    out.push(match msg {
        DiscoveryMsg::Advertise { .. } => KIND_ADVERTISE,
        DiscoveryMsg::Unadvertise { .. } => KIND_UNADVERTISE,
        DiscoveryMsg::Subscribe { .. } => KIND_SUBSCRIBE,
        DiscoveryMsg::Heartbeat => KIND_HEARTBEAT,
        DiscoveryMsg::Bye => KIND_BYE,
    });
    out.extend_from_slice(puuid.as_bytes());

    match msg {
        DiscoveryMsg::Advertise { endpoint, flavor }
        | DiscoveryMsg::Unadvertise { endpoint, flavor } => {
            put_str(&mut out, &endpoint.topic)?;
            put_str(&mut out, &endpoint.data_addr)?;
            put_str(&mut out, &endpoint.ctrl_addr)?;
            out.extend_from_slice(endpoint.nuuid.as_bytes());
            out.push(endpoint.scope.to_wire());
            put_str(&mut out, &endpoint.req_type)?;
            put_str(&mut out, &endpoint.rep_type)?;
            out.push(flavor.to_wire());
        }
        DiscoveryMsg::Subscribe { topic, flavor } => {
            put_str(&mut out, topic)?;
            out.push(flavor.to_wire());
        }
        DiscoveryMsg::Heartbeat | DiscoveryMsg::Bye => {}
    }

    if out.len() > MAX_DISCOVERY_DATAGRAM {
        return Err(Error::EncodeError(format!(
            "discovery datagram of {} bytes exceeds limit",
            out.len()
        )));
    }
    Ok(out)
}

/// Decode one datagram into the sender's process UUID and the message.
pub fn decode(buf: &[u8]) -> Result<(Uuid, DiscoveryMsg)> {
    let mut cur = Cursor::new(buf);
    let version = cur.u8()?;
    if version != WIRE_VERSION {
        return Err(Error::DiscoveryParseError(format!(
            "unsupported version {}",
            version
        )));
    }
    let kind = cur.u8()?;
    let puuid = cur.uuid()?;

    let msg = match kind {
        KIND_ADVERTISE | KIND_UNADVERTISE => {
            let topic = cur.str()?;
            let data_addr = cur.str()?;
            let ctrl_addr = cur.str()?;
            let nuuid = cur.uuid()?;
            let scope = Scope::from_wire(cur.u8()?)
                .ok_or_else(|| Error::DiscoveryParseError("bad scope byte".to_string()))?;
            let req_type = cur.str()?;
            let rep_type = cur.str()?;
            let flavor = Flavor::from_wire(cur.u8()?)
                .ok_or_else(|| Error::DiscoveryParseError("bad flavor byte".to_string()))?;
            let endpoint = Endpoint {
                topic,
                data_addr,
                ctrl_addr,
                puuid,
                nuuid,
                scope,
                req_type,
                rep_type,
            };
            if kind == KIND_ADVERTISE {
                DiscoveryMsg::Advertise { endpoint, flavor }
            } else {
                DiscoveryMsg::Unadvertise { endpoint, flavor }
            }
        }
        KIND_SUBSCRIBE => {
            let topic = cur.str()?;
            let flavor = Flavor::from_wire(cur.u8()?)
                .ok_or_else(|| Error::DiscoveryParseError("bad flavor byte".to_string()))?;
            DiscoveryMsg::Subscribe { topic, flavor }
        }
        KIND_HEARTBEAT => DiscoveryMsg::Heartbeat,
        KIND_BYE => DiscoveryMsg::Bye,
        other => {
            return Err(Error::DiscoveryParseError(format!(
                "unknown message kind {}",
                other
            )))
        }
    };
    Ok((puuid, msg))
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len: u16 = s
        .len()
        .try_into()
        .map_err(|_| Error::EncodeError(format!("string of {} bytes too long", s.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked reader over a datagram.
struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(Error::DiscoveryParseError(format!(
                "truncated datagram: need {} bytes at offset {}, have {}",
                n,
                self.off,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    fn str(&mut self) -> Result<String> {
        let raw = self.take(2)?;
        let len = u16::from_le_bytes([raw[0], raw[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::DiscoveryParseError(format!("non-UTF-8 string: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> Endpoint {
        Endpoint {
            topic: "@p@/foo".to_string(),
            data_addr: "127.0.0.1:4100".to_string(),
            ctrl_addr: "127.0.0.1:4101".to_string(),
            puuid: Uuid::generate(),
            nuuid: Uuid::generate(),
            scope: Scope::Host,
            req_type: "meshbus.msgs.Empty".to_string(),
            rep_type: "meshbus.msgs.Int32".to_string(),
        }
    }

    #[test]
    fn advertise_round_trip() {
        let ep = sample_endpoint();
        let sender = ep.puuid;
        let msg = DiscoveryMsg::Advertise {
            endpoint: ep.clone(),
            flavor: Flavor::Srv,
        };
        let datagram = encode(sender, &msg).expect("encode should succeed");
        let (puuid, decoded) = decode(&datagram).expect("decode should succeed");
        assert_eq!(puuid, sender);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn header_only_messages() {
        let sender = Uuid::generate();
        for msg in [DiscoveryMsg::Heartbeat, DiscoveryMsg::Bye] {
            let datagram = encode(sender, &msg).expect("encode should succeed");
            assert_eq!(datagram.len(), 18);
            let (puuid, decoded) = decode(&datagram).expect("decode should succeed");
            assert_eq!(puuid, sender);
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn subscribe_round_trip() {
        let sender = Uuid::generate();
        let msg = DiscoveryMsg::Subscribe {
            topic: "@p@/foo".to_string(),
            flavor: Flavor::Msg,
        };
        let datagram = encode(sender, &msg).expect("encode should succeed");
        let (_, decoded) = decode(&datagram).expect("decode should succeed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_datagrams_are_rejected() {
        let ep = sample_endpoint();
        let datagram = encode(
            ep.puuid,
            &DiscoveryMsg::Advertise {
                endpoint: ep.clone(),
                flavor: Flavor::Msg,
            },
        )
        .expect("encode should succeed");

        // every strict prefix must fail, never panic
        for cut in 0..datagram.len() {
            assert!(decode(&datagram[..cut]).is_err(), "prefix {} accepted", cut);
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        let sender = Uuid::generate();
        let mut datagram = encode(sender, &DiscoveryMsg::Heartbeat).expect("encode");
        datagram[0] = 99;
        assert!(matches!(
            decode(&datagram),
            Err(Error::DiscoveryParseError(_))
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let sender = Uuid::generate();
        let mut datagram = encode(sender, &DiscoveryMsg::Heartbeat).expect("encode");
        datagram[1] = 42;
        assert!(decode(&datagram).is_err());
    }
}
