// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast discovery.
//!
//! Owns the gossip socket and a background thread that services it
//! with a bounded read timeout, emits heartbeats (plus periodic
//! re-advertisements of every local endpoint), evicts processes that
//! fell silent beyond the TTL, answers SUBSCRIBE solicitations, and
//! fires connection/disconnection callbacks into the dataplane.
//!
//! Filtering happens on reception: datagrams from this process, from
//! foreign partitions, or with a scope that forbids the receiver are
//! dropped. Parse failures drop the datagram and the loop continues.

pub mod wire;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::{
    ACTIVITY_TTL, DISCOVERY_PORT, DISCOVERY_RECV_TIMEOUT, HEARTBEAT_INTERVAL,
    MAX_DISCOVERY_DATAGRAM, MULTICAST_GROUP,
};
use crate::core::guid::Uuid;
use crate::core::registry::AddressBook;
use crate::core::topic;
use crate::core::types::{Endpoint, Flavor, Scope};
use crate::error::{Error, Result};
use crate::transport;
use wire::DiscoveryMsg;

/// Callback fired with the endpoint that appeared or vanished.
/// Process-level disconnections carry [`Endpoint::process_exit`].
pub type EndpointCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

#[derive(Default)]
struct State {
    msg_book: AddressBook,
    srv_book: AddressBook,
    /// Last time each remote process was heard from.
    activity: HashMap<Uuid, Instant>,
}

#[derive(Default)]
struct Callbacks {
    msg_conn: Mutex<Option<EndpointCallback>>,
    msg_disc: Mutex<Option<EndpointCallback>>,
    srv_conn: Mutex<Option<EndpointCallback>>,
    srv_disc: Mutex<Option<EndpointCallback>>,
}

impl Callbacks {
    fn conn(&self, flavor: Flavor) -> Option<EndpointCallback> {
        match flavor {
            Flavor::Msg => self.msg_conn.lock().clone(),
            Flavor::Srv => self.srv_conn.lock().clone(),
        }
    }

    fn disc(&self, flavor: Flavor) -> Option<EndpointCallback> {
        match flavor {
            Flavor::Msg => self.msg_disc.lock().clone(),
            Flavor::Srv => self.srv_disc.lock().clone(),
        }
    }
}

/// Blocks `topic_list`/`service_list` until the discovery thread has
/// completed its first pass.
#[derive(Default)]
struct InitGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl InitGate {
    fn mark(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.cv.notify_all();
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            // Bounded so a wedged thread cannot hang callers forever.
            let result = self.cv.wait_for(&mut done, HEARTBEAT_INTERVAL);
            if result.timed_out() && !*done {
                log::warn!("[discovery] init wait timed out, proceeding");
                return;
            }
        }
    }
}

/// The discovery service. One per runtime.
pub struct Discovery {
    puuid: Uuid,
    prefix: String,
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    host_ips: Vec<Ipv4Addr>,
    state: Arc<Mutex<State>>,
    callbacks: Arc<Callbacks>,
    init: Arc<InitGate>,
    exit: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Bind the gossip socket. Fatal on bind failure; everything after
    /// bind-time is absorbed and retried.
    pub fn new(puuid: Uuid, partition: &str, iface: Ipv4Addr) -> Result<Self> {
        let socket = transport::discovery_socket(DISCOVERY_PORT, iface)
            .map_err(|e| Error::BindFailure(format!("discovery udp: {}", e)))?;
        socket
            .set_read_timeout(Some(DISCOVERY_RECV_TIMEOUT))
            .map_err(|e| Error::BindFailure(format!("discovery timeout: {}", e)))?;

        Ok(Self {
            puuid,
            prefix: topic::partition_prefix(partition),
            socket: Arc::new(socket),
            group: SocketAddr::from((MULTICAST_GROUP, DISCOVERY_PORT)),
            host_ips: transport::host_addrs(),
            state: Arc::new(Mutex::new(State::default())),
            callbacks: Arc::new(Callbacks::default()),
            init: Arc::new(InitGate::default()),
            exit: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Install the topic-plane callbacks. Must happen before `start`.
    pub fn set_msg_callbacks(&self, conn: EndpointCallback, disc: EndpointCallback) {
        *self.callbacks.msg_conn.lock() = Some(conn);
        *self.callbacks.msg_disc.lock() = Some(disc);
    }

    /// Install the service-plane callbacks. Must happen before `start`.
    pub fn set_srv_callbacks(&self, conn: EndpointCallback, disc: EndpointCallback) {
        *self.callbacks.srv_conn.lock() = Some(conn);
        *self.callbacks.srv_disc.lock() = Some(disc);
    }

    /// Spawn the discovery thread.
    pub fn start(&self) {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let callbacks = Arc::clone(&self.callbacks);
        let init = Arc::clone(&self.init);
        let exit = Arc::clone(&self.exit);
        let puuid = self.puuid;
        let prefix = self.prefix.clone();
        let group = self.group;
        let host_ips = self.host_ips.clone();

        let spawned = thread::Builder::new()
            .name("meshbus-discovery".to_string())
            .spawn(move || {
                run_loop(
                    socket, state, callbacks, init, exit, puuid, prefix, group, host_ips,
                );
            });
        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(e) => log::warn!("[discovery] failed to spawn thread: {}", e),
        }
    }

    /// Record a local endpoint and announce it to the group.
    pub fn advertise(&self, endpoint: Endpoint, flavor: Flavor) -> Result<()> {
        {
            let mut state = self.state.lock();
            book_mut(&mut state, flavor).add(endpoint.clone());
        }
        send(
            &self.socket,
            self.group,
            self.puuid,
            &DiscoveryMsg::Advertise { endpoint, flavor },
        );
        Ok(())
    }

    /// Withdraw a local endpoint and tell the group.
    pub fn unadvertise(&self, endpoint: Endpoint, flavor: Flavor) -> Result<()> {
        {
            let mut state = self.state.lock();
            book_mut(&mut state, flavor).del_by_node(
                &endpoint.topic,
                endpoint.puuid,
                endpoint.nuuid,
            );
        }
        send(
            &self.socket,
            self.group,
            self.puuid,
            &DiscoveryMsg::Unadvertise { endpoint, flavor },
        );
        Ok(())
    }

    /// Solicit advertisements for a topic, and replay already-known
    /// publishers to the connection callback so a new subscriber does
    /// not wait for the next heartbeat.
    pub fn discover(&self, wire_topic: &str, flavor: Flavor) {
        send(
            &self.socket,
            self.group,
            self.puuid,
            &DiscoveryMsg::Subscribe {
                topic: wire_topic.to_string(),
                flavor,
            },
        );

        let known: Vec<Endpoint> = {
            let state = self.state.lock();
            book(&state, flavor).endpoints(wire_topic)
        };
        if let Some(cb) = self.callbacks.conn(flavor) {
            for ep in &known {
                cb(ep);
            }
        }
    }

    /// Every endpoint advertising a topic.
    pub fn publishers(&self, wire_topic: &str, flavor: Flavor) -> Vec<Endpoint> {
        let state = self.state.lock();
        book(&state, flavor).endpoints(wire_topic)
    }

    /// Plain (partition-stripped) names of all known topics.
    pub fn topic_list(&self) -> Vec<String> {
        self.init.wait();
        let state = self.state.lock();
        strip_and_sort(state.msg_book.topics())
    }

    /// Plain names of all known services.
    pub fn service_list(&self) -> Vec<String> {
        self.init.wait();
        let state = self.state.lock();
        strip_and_sort(state.srv_book.topics())
    }

    /// Graceful shutdown: announce BYE, stop and join the thread.
    /// Idempotent; also invoked from `Drop`.
    pub(crate) fn stop(&self) {
        if self.exit.swap(true, Ordering::Relaxed) {
            return;
        }
        send(&self.socket, self.group, self.puuid, &DiscoveryMsg::Bye);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn book<'a>(state: &'a State, flavor: Flavor) -> &'a AddressBook {
    match flavor {
        Flavor::Msg => &state.msg_book,
        Flavor::Srv => &state.srv_book,
    }
}

fn book_mut<'a>(state: &'a mut State, flavor: Flavor) -> &'a mut AddressBook {
    match flavor {
        Flavor::Msg => &mut state.msg_book,
        Flavor::Srv => &mut state.srv_book,
    }
}

fn strip_and_sort(wire_topics: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = wire_topics
        .iter()
        .filter_map(|t| topic::unscope(t))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

fn send(socket: &UdpSocket, group: SocketAddr, puuid: Uuid, msg: &DiscoveryMsg) {
    match wire::encode(puuid, msg) {
        Ok(datagram) => {
            if let Err(e) = socket.send_to(&datagram, group) {
                log::debug!("[discovery] send to {} failed: {}", group, e);
            }
        }
        Err(e) => log::debug!("[discovery] encode failed: {}", e),
    }
}

/// Main loop (runs in the discovery thread).
#[allow(clippy::too_many_arguments)]
fn run_loop(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<State>>,
    callbacks: Arc<Callbacks>,
    init: Arc<InitGate>,
    exit: Arc<AtomicBool>,
    puuid: Uuid,
    prefix: String,
    group: SocketAddr,
    host_ips: Vec<Ipv4Addr>,
) {
    log::debug!(
        "[discovery] thread started proc={} group={} prefix={}",
        puuid,
        group,
        prefix
    );

    let mut buf = vec![0u8; MAX_DISCOVERY_DATAGRAM];
    let mut last_beat: Option<Instant> = None;

    while !exit.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _src)) => {
                handle_datagram(
                    &buf[..len],
                    &socket,
                    &state,
                    &callbacks,
                    puuid,
                    &prefix,
                    group,
                    &host_ips,
                );
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::debug!("[discovery] recv error: {}", e);
            }
        }

        let beat_due = last_beat.map_or(true, |t| t.elapsed() >= HEARTBEAT_INTERVAL);
        if beat_due {
            heartbeat(&socket, &state, puuid, group);
            evict_stale(&state, &callbacks);
            last_beat = Some(Instant::now());
        }

        init.mark();
    }

    log::debug!("[discovery] thread exiting proc={}", puuid);
}

/// Emit a heartbeat and refresh every local advertisement, so late
/// joiners converge without per-topic solicitation.
fn heartbeat(socket: &UdpSocket, state: &Mutex<State>, puuid: Uuid, group: SocketAddr) {
    send(socket, group, puuid, &DiscoveryMsg::Heartbeat);

    let (msgs, srvs) = {
        let state = state.lock();
        (
            state.msg_book.endpoints_of_proc(puuid),
            state.srv_book.endpoints_of_proc(puuid),
        )
    };
    for ep in msgs {
        send(
            socket,
            group,
            puuid,
            &DiscoveryMsg::Advertise {
                endpoint: ep,
                flavor: Flavor::Msg,
            },
        );
    }
    for ep in srvs {
        send(
            socket,
            group,
            puuid,
            &DiscoveryMsg::Advertise {
                endpoint: ep,
                flavor: Flavor::Srv,
            },
        );
    }
}

/// Drop every process that fell silent beyond the TTL and fire
/// process-level disconnections for it.
fn evict_stale(state: &Mutex<State>, callbacks: &Callbacks) {
    let mut evicted: Vec<(Uuid, bool, bool)> = Vec::new();
    {
        let mut state = state.lock();
        let expired: Vec<Uuid> = state
            .activity
            .iter()
            .filter(|(_, last)| last.elapsed() > ACTIVITY_TTL)
            .map(|(p, _)| *p)
            .collect();
        for p in expired {
            state.activity.remove(&p);
            let had_msgs = !state.msg_book.del_by_proc(p).is_empty();
            let had_srvs = !state.srv_book.del_by_proc(p).is_empty();
            evicted.push((p, had_msgs, had_srvs));
        }
    }

    for (p, had_msgs, had_srvs) in evicted {
        log::debug!("[discovery] evicting silent process {}", p);
        let exit_ep = Endpoint::process_exit(p);
        if had_msgs {
            if let Some(cb) = callbacks.disc(Flavor::Msg) {
                cb(&exit_ep);
            }
        }
        if had_srvs {
            if let Some(cb) = callbacks.disc(Flavor::Srv) {
                cb(&exit_ep);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_datagram(
    datagram: &[u8],
    socket: &UdpSocket,
    state: &Mutex<State>,
    callbacks: &Callbacks,
    puuid: Uuid,
    prefix: &str,
    group: SocketAddr,
    host_ips: &[Ipv4Addr],
) {
    let (sender, msg) = match wire::decode(datagram) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::debug!("[discovery] dropping datagram: {}", e);
            return;
        }
    };
    if sender == puuid {
        return;
    }

    state.lock().activity.insert(sender, Instant::now());

    match msg {
        DiscoveryMsg::Advertise { endpoint, flavor } => {
            if !endpoint.topic.starts_with(prefix) {
                return;
            }
            if !scope_admits(&endpoint, host_ips) {
                log::debug!(
                    "[discovery] scope forbids advertisement of [{}] from {}",
                    endpoint.topic,
                    sender
                );
                return;
            }
            let added = {
                let mut state = state.lock();
                book_mut(&mut state, flavor).add(endpoint.clone())
            };
            if added {
                log::debug!(
                    "[discovery] new {:?} endpoint [{}] at {} proc={}",
                    flavor,
                    endpoint.topic,
                    endpoint.data_addr,
                    sender
                );
                if let Some(cb) = callbacks.conn(flavor) {
                    cb(&endpoint);
                }
            }
        }
        DiscoveryMsg::Unadvertise { endpoint, flavor } => {
            if !endpoint.topic.starts_with(prefix) {
                return;
            }
            let removed = {
                let mut state = state.lock();
                book_mut(&mut state, flavor).del_by_node(
                    &endpoint.topic,
                    endpoint.puuid,
                    endpoint.nuuid,
                )
            };
            if let Some(removed) = removed {
                if let Some(cb) = callbacks.disc(flavor) {
                    cb(&removed);
                }
            }
        }
        DiscoveryMsg::Subscribe { topic, flavor } => {
            if !topic.starts_with(prefix) {
                return;
            }
            // Solicitation: replay our own advertisements for the topic.
            let locals: Vec<Endpoint> = {
                let state = state.lock();
                book(&state, flavor)
                    .endpoints(&topic)
                    .into_iter()
                    .filter(|ep| ep.puuid == puuid)
                    .collect()
            };
            for ep in locals {
                send(
                    socket,
                    group,
                    puuid,
                    &DiscoveryMsg::Advertise {
                        endpoint: ep,
                        flavor,
                    },
                );
            }
        }
        DiscoveryMsg::Heartbeat => {
            // Activity already refreshed above.
        }
        DiscoveryMsg::Bye => {
            let (had_msgs, had_srvs) = {
                let mut state = state.lock();
                state.activity.remove(&sender);
                (
                    !state.msg_book.del_by_proc(sender).is_empty(),
                    !state.srv_book.del_by_proc(sender).is_empty(),
                )
            };
            log::debug!("[discovery] process {} said goodbye", sender);
            let exit_ep = Endpoint::process_exit(sender);
            if had_msgs {
                if let Some(cb) = callbacks.disc(Flavor::Msg) {
                    cb(&exit_ep);
                }
            }
            if had_srvs {
                if let Some(cb) = callbacks.disc(Flavor::Srv) {
                    cb(&exit_ep);
                }
            }
        }
    }
}

/// Scope filter for received advertisements. `process` scope never
/// crosses the process boundary (same-process senders were already
/// filtered out); `host` scope requires the advertised address to be
/// one of ours.
fn scope_admits(endpoint: &Endpoint, host_ips: &[Ipv4Addr]) -> bool {
    match endpoint.scope {
        Scope::Process => false,
        Scope::Host => endpoint
            .data_addr
            .split(':')
            .next()
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            .is_some_and(|ip| host_ips.contains(&ip)),
        Scope::All => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(scope: Scope, addr: &str) -> Endpoint {
        Endpoint {
            topic: "@p@/t".to_string(),
            data_addr: addr.to_string(),
            ctrl_addr: addr.to_string(),
            puuid: Uuid::generate(),
            nuuid: Uuid::generate(),
            scope,
            req_type: "meshbus.msgs.Int32".to_string(),
            rep_type: String::new(),
        }
    }

    #[test]
    fn scope_filtering() {
        let ours = vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(10, 1, 2, 3)];
        assert!(!scope_admits(&ep(Scope::Process, "127.0.0.1:1"), &ours));
        assert!(scope_admits(&ep(Scope::Host, "10.1.2.3:9"), &ours));
        assert!(!scope_admits(&ep(Scope::Host, "10.9.9.9:9"), &ours));
        assert!(scope_admits(&ep(Scope::All, "203.0.113.7:1"), &ours));
        // unparsable address never passes a host check
        assert!(!scope_admits(&ep(Scope::Host, "bogus"), &ours));
    }

    #[test]
    fn strip_and_sort_dedups() {
        let names = strip_and_sort(vec![
            "@p@/b".to_string(),
            "@p@/a".to_string(),
            "@q@/a".to_string(),
        ]);
        assert_eq!(names, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn init_gate_releases_waiters() {
        let gate = Arc::new(InitGate::default());
        let g = Arc::clone(&gate);
        let waiter = thread::spawn(move || g.wait());
        thread::sleep(std::time::Duration::from_millis(20));
        gate.mark();
        waiter.join().expect("waiter should finish");
    }
}
