// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshbus - brokerless pub/sub and service calls
//!
//! A peer-to-peer messaging middleware: named topic publish/subscribe
//! and request/reply across processes on a local network, with no
//! central broker. Publishers and subscribers in the same process
//! short-circuit to direct delivery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbus::{msgs::Int32, Node, Runtime, Scope};
//! use std::time::Duration;
//!
//! fn main() -> meshbus::Result<()> {
//!     let runtime = Runtime::new()?;
//!     let node = Node::new(&runtime);
//!
//!     // Pub/sub
//!     node.subscribe("/chatter", |msg: &Int32| println!("got {}", msg.data))?;
//!     node.advertise::<Int32>("/chatter", Scope::All)?;
//!     node.publish("/chatter", &Int32::new(42))?;
//!
//!     // Services
//!     node.advertise_service("/echo", |req: &Int32| Ok(Int32::new(req.data)))?;
//!     let rep: Int32 = node.request("/echo", &Int32::new(5), Duration::from_secs(1))?;
//!     assert_eq!(rep.data, 5);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Node facade                           |
//! |  advertise / publish / subscribe / request / introspection   |
//! +--------------------------------------------------------------+
//! |                 Runtime (one per process)                    |
//! |  reception thread | pending requests | registries | sockets  |
//! +--------------------------------------------------------------+
//! |  Discovery (UDP multicast)   |   Dataplane (TCP)             |
//! |  gossip, heartbeats, TTL     |   fan-out, control, framing   |
//! +--------------------------------------------------------------+
//! ```
//!
//! Discovery announces publishers over UDP multicast; matching
//! advertisements drive TCP connections from subscribers to
//! publishers. Service calls ride the control sockets with
//! request-id correlation and typed matching.
//!
//! ## Environment
//!
//! - `MESHBUS_PARTITION` scopes every topic to a namespace.
//! - `MESHBUS_VERBOSE=1` enables diagnostic logging.
//! - `MESHBUS_IP` overrides the advertised host address.

/// Wire constants and the environment-driven configuration.
pub mod config;
/// Identifiers, endpoint records, registries, topic scoping.
pub mod core;
/// UDP multicast gossip: announce, locate, invalidate.
pub mod discovery;
mod error;
mod logging;
/// The participant facade and the per-process runtime.
pub mod node;
/// The payload codec contract and built-in message types.
pub mod payload;
/// Service-call engine: pending requests and correlation.
pub mod rpc;
/// Socket setup and TCP framing.
pub mod transport;

pub use crate::core::types::Scope;
pub use config::Config;
pub use error::{Error, Result};
pub use node::{Node, Runtime, ServicePublisher};
pub use payload::Payload;

/// Built-in message types, re-exported for convenience.
pub mod msgs {
    pub use crate::payload::msgs::{Blob, Empty, Int32, Text, Vector3d};
}

/// meshbus version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
