// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload codec contract.
//!
//! The transport never inspects payload bytes; it delegates to this
//! trait for encoding at publish/request time and decoding at
//! delivery time, and matches the canonical type name against the
//! descriptor declared on the other side. A mismatch is a
//! per-delivery failure, not a transport error.

pub mod msgs;

use crate::error::Result;

/// A value that can cross the wire.
///
/// `type_name` is the canonical descriptor compared between publisher
/// and subscriber (and between requester and replier). Two peers
/// interoperate on a topic only when their descriptors are equal.
pub trait Payload: Sized + Send + 'static {
    /// Canonical type descriptor, e.g. `meshbus.msgs.Int32`.
    fn type_name() -> &'static str;

    /// Encode to bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the value cannot be represented.
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode from bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the bytes do not form a value of this type.
    fn decode(bytes: &[u8]) -> Result<Self>;
}
