// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes all wire/protocol constants and the
//! environment-driven runtime configuration. Never hardcode these
//! values elsewhere.

use std::net::Ipv4Addr;
use std::time::Duration;

// =======================================================================
// Discovery wire constants
// =======================================================================

/// Well-known UDP port for the discovery gossip.
pub const DISCOVERY_PORT: u16 = 11319;

/// Multicast group joined by every participant.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 7);

/// Discovery wire format version carried in every datagram.
pub const WIRE_VERSION: u8 = 1;

/// Largest discovery datagram we build or accept.
pub const MAX_DISCOVERY_DATAGRAM: usize = 65_000;

// =======================================================================
// Timing
// =======================================================================

/// Interval between heartbeats (and local endpoint re-advertisements).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Silence threshold after which a remote process is evicted.
///
/// 3x the heartbeat interval, so two lost heartbeats are tolerated.
pub const ACTIVITY_TTL: Duration = Duration::from_millis(3000);

/// Bounded timeout for the reception thread's poll.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Bounded read timeout for the discovery thread's UDP receive.
pub const DISCOVERY_RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Connect timeout when dialing a freshly discovered peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Linger applied to transient outbound control connections so a dead
/// peer cannot block teardown indefinitely.
pub const CONTROL_LINGER: Duration = Duration::from_millis(200);

/// Deadline applied to asynchronous service requests. The reception
/// loop sweeps expired entries on every wake-up.
pub const ASYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =======================================================================
// Dataplane limits
// =======================================================================

/// Largest TCP frame we accept before declaring the stream corrupt.
/// Sized for the benchmark's 4 MB payload ladder with headroom.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// =======================================================================
// Environment variables
// =======================================================================

/// Partition name prefixed to every topic on the wire.
pub const ENV_PARTITION: &str = "MESHBUS_PARTITION";

/// Set to `1` to enable diagnostic logging.
pub const ENV_VERBOSE: &str = "MESHBUS_VERBOSE";

/// Overrides the host address advertised to peers.
pub const ENV_IP: &str = "MESHBUS_IP";

/// Runtime configuration consumed by [`crate::node::Runtime`].
///
/// Built from the environment with [`Config::from_env`], or constructed
/// directly (tests construct it directly to avoid process-global state).
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Logical namespace; processes with different partitions are
    /// mutually invisible even on the same multicast group.
    pub partition: String,
    /// Diagnostic logging toggle.
    pub verbose: bool,
    /// Host address advertised to peers. `None` means auto-detect.
    pub host_ip: Option<Ipv4Addr>,
}

impl Config {
    /// Read configuration from `MESHBUS_PARTITION`, `MESHBUS_VERBOSE`
    /// and `MESHBUS_IP`.
    pub fn from_env() -> Self {
        let partition = std::env::var(ENV_PARTITION).unwrap_or_default();
        let verbose = std::env::var(ENV_VERBOSE).map(|v| v == "1").unwrap_or(false);
        let host_ip = std::env::var(ENV_IP).ok().and_then(|raw| {
            match raw.parse::<Ipv4Addr>() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    log::warn!("[config] ignoring invalid {}='{}': {}", ENV_IP, raw, err);
                    None
                }
            }
        });

        Self {
            partition,
            verbose,
            host_ip,
        }
    }

    /// Config pinned to the loopback interface with a given partition.
    /// Keeps multi-runtime tests isolated and working on machines
    /// without a routable interface.
    pub fn loopback(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
            verbose: false,
            host_ip: Some(Ipv4Addr::LOCALHOST),
        }
    }
}
