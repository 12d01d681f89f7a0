// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared vocabulary types: advertisement scope, endpoint flavor,
//! control opcodes, and the endpoint record itself.

use crate::core::guid::Uuid;

/// Visibility of an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Only nodes in the same process may connect.
    Process,
    /// Only peers on the same host may connect.
    Host,
    /// Any reachable peer may connect.
    #[default]
    All,
}

impl Scope {
    /// Wire byte for discovery datagrams.
    pub fn to_wire(self) -> u8 {
        match self {
            Scope::Process => 0,
            Scope::Host => 1,
            Scope::All => 2,
        }
    }

    /// Parse a wire byte; unknown values are rejected by the caller.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Scope::Process),
            1 => Some(Scope::Host),
            2 => Some(Scope::All),
            _ => None,
        }
    }
}

/// Whether an endpoint publishes a topic or serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Topic publisher.
    Msg,
    /// Service replier.
    Srv,
}

impl Flavor {
    pub fn to_wire(self) -> u8 {
        match self {
            Flavor::Msg => 0,
            Flavor::Srv => 1,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Flavor::Msg),
            1 => Some(Flavor::Srv),
            _ => None,
        }
    }
}

/// Control-channel opcode.
///
/// Encoded as a textual decimal integer on the wire (the historical
/// format; peers parse it with an integer conversion, so the textual
/// encoding is preserved for interoperability).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    NewConnection,
    EndConnection,
    ServiceRequest,
    ServiceResponse,
}

impl ControlOp {
    /// Textual wire form.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            ControlOp::NewConnection => "1",
            ControlOp::EndConnection => "2",
            ControlOp::ServiceRequest => "3",
            ControlOp::ServiceResponse => "4",
        }
    }

    /// Parse the textual wire form.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s.trim().parse::<i32>().ok()? {
            1 => Some(ControlOp::NewConnection),
            2 => Some(ControlOp::EndConnection),
            3 => Some(ControlOp::ServiceRequest),
            4 => Some(ControlOp::ServiceResponse),
            _ => None,
        }
    }
}

/// Everything needed to reach one advertisement.
///
/// `req_type` holds the message type for topic endpoints and the
/// request type for service endpoints; `rep_type` is empty for topic
/// endpoints. Partial endpoints (empty addresses) are used in the
/// remote-subscribers book, which only tracks identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Partition-scoped topic name.
    pub topic: String,
    /// `ip:port` of the publisher's data (fan-out) socket.
    pub data_addr: String,
    /// `ip:port` of the publisher's control socket.
    pub ctrl_addr: String,
    /// Owning process.
    pub puuid: Uuid,
    /// Owning node within the process.
    pub nuuid: Uuid,
    /// Who may connect.
    pub scope: Scope,
    /// Message type (topics) or request type (services).
    pub req_type: String,
    /// Response type (services only).
    pub rep_type: String,
}

impl Endpoint {
    /// Identity-only endpoint, as carried by NEW_CONNECTION frames.
    pub fn identity(topic: &str, puuid: Uuid, nuuid: Uuid) -> Self {
        Self {
            topic: topic.to_string(),
            data_addr: String::new(),
            ctrl_addr: String::new(),
            puuid,
            nuuid,
            scope: Scope::All,
            req_type: String::new(),
            rep_type: String::new(),
        }
    }

    /// Process-level marker used for whole-process disconnections.
    pub fn process_exit(puuid: Uuid) -> Self {
        Self::identity("", puuid, Uuid::NIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_wire_round_trip() {
        for scope in [Scope::Process, Scope::Host, Scope::All] {
            assert_eq!(Scope::from_wire(scope.to_wire()), Some(scope));
        }
        assert_eq!(Scope::from_wire(9), None);
    }

    #[test]
    fn control_op_textual_encoding() {
        assert_eq!(ControlOp::NewConnection.as_wire_str(), "1");
        assert_eq!(ControlOp::from_wire_str("2"), Some(ControlOp::EndConnection));
        assert_eq!(ControlOp::from_wire_str("4"), Some(ControlOp::ServiceResponse));
        assert_eq!(ControlOp::from_wire_str("17"), None);
        assert_eq!(ControlOp::from_wire_str("x"), None);
    }

    #[test]
    fn process_exit_marker() {
        let p = Uuid::generate();
        let ep = Endpoint::process_exit(p);
        assert!(ep.topic.is_empty());
        assert!(ep.nuuid.is_nil());
        assert_eq!(ep.puuid, p);
    }
}
