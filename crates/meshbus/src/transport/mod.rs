// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket construction and one-shot control sends.
//!
//! Consolidates the `socket2` setup for the discovery UDP socket
//! (reuse flags, multicast join, loopback) and the TCP listeners, plus
//! the transient outbound control connection with a bounded linger.

pub mod frame;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::{CONNECT_TIMEOUT, CONTROL_LINGER, MULTICAST_GROUP};
use crate::error::{Error, Result};

/// Build the discovery UDP socket: bound to the well-known port with
/// address reuse so several runtimes on one host share the gossip,
/// joined to the multicast group with loopback on.
///
/// SO_REUSEADDR only, deliberately no SO_REUSEPORT: Linux
/// load-balances multicast across a reuseport group, so each process
/// would only see some of the gossip. With plain address reuse every
/// joined socket receives a copy.
///
/// `iface` selects the interface used for outbound multicast; pinning
/// it to the loopback address keeps discovery working on hosts without
/// a routable interface.
pub fn discovery_socket(port: u16, iface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    if let Err(e) = socket.set_multicast_if_v4(&iface) {
        log::debug!("[udp] set_multicast_if_v4({}) failed (non-fatal): {}", iface, e);
    }
    let socket: UdpSocket = socket.into();

    // Join on the chosen interface first, then on UNSPECIFIED as a
    // catch-all. Join failures are non-fatal on constrained hosts.
    if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &iface) {
        log::debug!(
            "[udp] join_multicast_v4({}) on {} failed (non-fatal): {}",
            MULTICAST_GROUP,
            iface,
            e
        );
    }
    if iface != Ipv4Addr::UNSPECIFIED {
        if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
            log::debug!(
                "[udp] join_multicast_v4({}) on UNSPECIFIED failed (non-fatal): {}",
                MULTICAST_GROUP,
                e
            );
        }
    }

    socket.set_multicast_loop_v4(true)?;
    let _ = socket.set_multicast_ttl_v4(1);

    log::debug!(
        "[udp] discovery socket bound to {} group={} iface={}",
        bind_addr,
        MULTICAST_GROUP,
        iface
    );
    Ok(socket)
}

/// Bind a TCP listener on an OS-assigned port, non-blocking, and
/// return it with its resolved address.
pub fn tcp_listener(host: Ipv4Addr) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(SocketAddr::from((host, 0)))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Open a transient control connection, write one frame, drop.
///
/// The short linger bounds how long the close may block when the peer
/// died between discovery and the send.
pub fn send_one_shot(addr: &str, frame: &[u8]) -> Result<()> {
    let target: SocketAddr = addr
        .parse()
        .map_err(|e| Error::PeerUnreachable(format!("{}: {}", addr, e)))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
        .map_err(|e| Error::PeerUnreachable(format!("{}: {}", addr, e)))?;
    let _ = stream.set_nodelay(true);
    if let Err(e) = SockRef::from(&stream).set_linger(Some(CONTROL_LINGER)) {
        log::debug!("[ctrl] set_linger on {} failed (non-fatal): {}", addr, e);
    }

    use std::io::Write;
    (&stream)
        .write_all(frame)
        .map_err(|e| Error::SendFailed(format!("{}: {}", addr, e)))?;
    Ok(())
}

/// Pick the host address advertised to peers: the configured override,
/// else the primary interface, else loopback.
pub fn host_addr(configured: Option<Ipv4Addr>) -> Ipv4Addr {
    if let Some(ip) = configured {
        return ip;
    }
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(ip)) => ip,
        Ok(other) => {
            log::debug!("[udp] primary address {} is not IPv4, using loopback", other);
            Ipv4Addr::LOCALHOST
        }
        Err(e) => {
            log::debug!("[udp] interface detection failed ({}), using loopback", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Every IPv4 address of this host, loopback included. Used to decide
/// whether a host-scoped advertisement originates from this machine.
pub fn host_addrs() -> Vec<Ipv4Addr> {
    let mut addrs = vec![Ipv4Addr::LOCALHOST];
    if let Ok(ifs) = local_ip_address::list_afinet_netifas() {
        for (_name, ip) in ifs {
            if let std::net::IpAddr::V4(v4) = ip {
                if !addrs.contains(&v4) {
                    addrs.push(v4);
                }
            }
        }
    }
    addrs
}
