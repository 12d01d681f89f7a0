// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-process resource group.
//!
//! [`Runtime`] owns the publish and control TCP listeners, the
//! reception thread, the discovery service, and every registry of the
//! dataplane. Nodes are lightweight facades over one shared runtime.
//!
//! # Threads
//!
//! - `meshbus-rx` polls the subscribe streams and the control plane
//!   with a bounded timeout, accepts publish fan-out connections, and
//!   sweeps expired asynchronous requests on every wake-up.
//! - `meshbus-discovery` (owned by [`Discovery`]) services the gossip
//!   socket and the heartbeat timer.
//!
//! # Lock discipline
//!
//! One mutex (`plane`) guards every dataplane registry, and socket
//! writes happen under it so a message's frame is never interleaved
//! with another's. Two rules keep this deadlock-free:
//!
//! - user callbacks (subscription handlers, service handlers, async
//!   response callbacks) are invoked only after the lock is released,
//!   so a handler may publish or issue requests;
//! - discovery methods are never called while holding the lock (the
//!   discovery thread takes its own lock and then calls back into the
//!   plane).

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;

use crate::config::{Config, CONNECT_TIMEOUT, POLL_TIMEOUT};
use crate::core::guid::Uuid;
use crate::core::registry::AddressBook;
use crate::core::subscription::{DeliveryFn, HandlerEntry, HandlerTable};
use crate::core::topic;
use crate::core::types::{ControlOp, Endpoint, Flavor, Scope};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::logging;
use crate::rpc::{AsyncOutcome, Pending, PendingBook, ResponseMode, ServiceRecord, SyncSlot};
use crate::transport::frame::{self, FrameBuf};
use crate::transport::{self, send_one_shot};

const CTRL_LISTENER: Token = Token(0);
const FIRST_CONN_TOKEN: usize = 1;

/// A locally advertised topic.
#[derive(Debug, Clone)]
struct LocalTopic {
    type_name: String,
    scope: Scope,
}

/// Inbound subscribe-side connection to a remote publisher.
struct SubConn {
    stream: MioTcpStream,
    buf: FrameBuf,
}

/// Accepted control connection.
struct CtrlConn {
    stream: MioTcpStream,
    buf: FrameBuf,
}

/// Everything the reception thread and the facades share, guarded by
/// one mutex.
struct Plane {
    pub_listener: std::net::TcpListener,
    pub_conns: Vec<std::net::TcpStream>,
    ctrl_listener: MioTcpListener,
    sub_conns: HashMap<Token, SubConn>,
    /// data address of a remote publish socket -> its token.
    sub_tokens: HashMap<String, Token>,
    ctrl_conns: HashMap<Token, CtrlConn>,
    next_token: usize,
    /// Wire topics the subscribe side filters on.
    filters: HashSet<String>,
    subscriptions: HandlerTable,
    /// Remote publishers this process is connected to.
    connections: AddressBook,
    /// Remote subscribers interested in our topics.
    remote_subscribers: AddressBook,
    /// Locally advertised topics, per node.
    topics: HashMap<String, HashMap<Uuid, LocalTopic>>,
    /// Locally advertised services, per node.
    services: HashMap<String, HashMap<Uuid, ServiceRecord>>,
}

impl Plane {
    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

/// Shared state behind every [`Node`](crate::node::Node) of a process.
pub(crate) struct Inner {
    pub(crate) puuid: Uuid,
    partition: String,
    data_addr: String,
    ctrl_addr: String,
    plane: Mutex<Plane>,
    pending: PendingBook,
    registry: Registry,
    exit: AtomicBool,
    pub(crate) discovery: Discovery,
}

/// The per-process resource group: sockets, registries, and the two
/// background threads. Construct once, share among nodes, drop to
/// tear everything down (exit flags set, threads joined, BYE sent).
pub struct Runtime {
    inner: Arc<Inner>,
    recv_thread: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Build a runtime from the environment
    /// (`MESHBUS_PARTITION`/`MESHBUS_VERBOSE`/`MESHBUS_IP`).
    pub fn new() -> Result<Self> {
        Self::with_config(Config::from_env())
    }

    /// Build a runtime from an explicit configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        logging::init(config.verbose);

        let puuid = Uuid::generate();
        let host = transport::host_addr(config.host_ip);

        let (pub_listener, pub_addr) = transport::tcp_listener(host)
            .map_err(|e| Error::BindFailure(format!("publish socket: {}", e)))?;
        let (ctrl_std, ctrl_addr) = transport::tcp_listener(host)
            .map_err(|e| Error::BindFailure(format!("control socket: {}", e)))?;
        let mut ctrl_listener = MioTcpListener::from_std(ctrl_std);

        let poll = Poll::new().map_err(|e| Error::BindFailure(format!("poll: {}", e)))?;
        poll.registry()
            .register(&mut ctrl_listener, CTRL_LISTENER, Interest::READABLE)
            .map_err(|e| Error::BindFailure(format!("register control: {}", e)))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::BindFailure(format!("registry clone: {}", e)))?;

        let discovery = Discovery::new(puuid, &config.partition, host)?;

        log::debug!(
            "[node] runtime up proc={} data={} ctrl={} partition='{}'",
            puuid,
            pub_addr,
            ctrl_addr,
            config.partition
        );

        let inner = Arc::new(Inner {
            puuid,
            partition: config.partition.clone(),
            data_addr: pub_addr.to_string(),
            ctrl_addr: ctrl_addr.to_string(),
            plane: Mutex::new(Plane {
                pub_listener,
                pub_conns: Vec::new(),
                ctrl_listener,
                sub_conns: HashMap::new(),
                sub_tokens: HashMap::new(),
                ctrl_conns: HashMap::new(),
                next_token: FIRST_CONN_TOKEN,
                filters: HashSet::new(),
                subscriptions: HandlerTable::new(),
                connections: AddressBook::new(),
                remote_subscribers: AddressBook::new(),
                topics: HashMap::new(),
                services: HashMap::new(),
            }),
            pending: PendingBook::new(),
            registry,
            exit: AtomicBool::new(false),
            discovery,
        });

        // Discovery keeps only weak handles into the dataplane; the
        // runtime's ownership of both sides bounds their lifetime.
        let weak = Arc::downgrade(&inner);
        inner.discovery.set_msg_callbacks(
            callback(&weak, Inner::on_msg_connection),
            callback(&weak, Inner::on_msg_disconnection),
        );
        inner.discovery.set_srv_callbacks(
            callback(&weak, Inner::on_srv_connection),
            callback(&weak, Inner::on_srv_disconnection),
        );
        inner.discovery.start();

        let thread_inner = Arc::clone(&inner);
        let recv_thread = thread::Builder::new()
            .name("meshbus-rx".to_string())
            .spawn(move || reception_loop(thread_inner, poll))
            .map_err(|e| Error::BindFailure(format!("reception thread: {}", e)))?;

        Ok(Self {
            inner,
            recv_thread: Some(recv_thread),
        })
    }

    /// This process's UUID.
    pub fn process_uuid(&self) -> Uuid {
        self.inner.puuid
    }

    pub(crate) fn inner_arc(&self) -> Arc<Inner> {
        Arc::clone(&self.inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Relaxed);
        self.inner.discovery.stop();
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        log::debug!("[node] runtime down proc={}", self.inner.puuid);
    }
}

/// Adapt an `Inner` method into a discovery callback that silently
/// expires with the runtime.
fn callback(
    weak: &Weak<Inner>,
    f: fn(&Inner, &Endpoint),
) -> Arc<dyn Fn(&Endpoint) + Send + Sync> {
    let weak = weak.clone();
    Arc::new(move |ep| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, ep);
        }
    })
}

// ===== Facade operations =====

impl Inner {
    fn guard_running(&self) -> Result<()> {
        if self.exit.load(Ordering::Relaxed) {
            Err(Error::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    pub(crate) fn advertise(
        &self,
        node: Uuid,
        plain: &str,
        type_name: &str,
        scope: Scope,
    ) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);
        {
            let mut plane = self.plane.lock();
            plane.topics.entry(wire.clone()).or_default().insert(
                node,
                LocalTopic {
                    type_name: type_name.to_string(),
                    scope,
                },
            );
        }
        self.discovery.advertise(
            Endpoint {
                topic: wire,
                data_addr: self.data_addr.clone(),
                ctrl_addr: self.ctrl_addr.clone(),
                puuid: self.puuid,
                nuuid: node,
                scope,
                req_type: type_name.to_string(),
                rep_type: String::new(),
            },
            Flavor::Msg,
        )
    }

    pub(crate) fn unadvertise(&self, node: Uuid, plain: &str) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);
        let removed = {
            let mut plane = self.plane.lock();
            let removed = plane
                .topics
                .get_mut(&wire)
                .and_then(|nodes| nodes.remove(&node));
            if plane.topics.get(&wire).is_some_and(HashMap::is_empty) {
                plane.topics.remove(&wire);
            }
            removed
        };
        if let Some(local) = removed {
            self.discovery.unadvertise(
                Endpoint {
                    topic: wire,
                    data_addr: self.data_addr.clone(),
                    ctrl_addr: self.ctrl_addr.clone(),
                    puuid: self.puuid,
                    nuuid: node,
                    scope: local.scope,
                    req_type: local.type_name,
                    rep_type: String::new(),
                },
                Flavor::Msg,
            )?;
        }
        Ok(())
    }

    pub(crate) fn publish(
        &self,
        node: Uuid,
        plain: &str,
        type_name: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);

        let local_handlers = {
            let mut plane = self.plane.lock();
            let Some(advert) = plane.topics.get(&wire).and_then(|nodes| nodes.get(&node)) else {
                return Err(Error::NotAdvertised(plain.to_string()));
            };
            if advert.type_name != type_name {
                return Err(Error::TypeMismatch);
            }

            if plane.remote_subscribers.has_topic(&wire) && !plane.pub_conns.is_empty() {
                // Socket writes stay under the lock so a frame's bytes
                // are never interleaved with another publisher's.
                let frame = frame::data_frame(&wire, &self.data_addr, payload);
                plane.pub_conns.retain_mut(|stream| {
                    match stream.write_all(&frame) {
                        Ok(()) => true,
                        Err(e) => {
                            log::debug!("[node] dropping fan-out connection: {}", e);
                            false
                        }
                    }
                });
            }

            plane.subscriptions.handlers(&wire)
        };

        // In-process short-circuit, outside the lock so handlers may
        // publish in turn.
        for handler in &local_handlers {
            if handler.type_name != type_name {
                log::debug!(
                    "[node] local delivery on [{}] skipped: handler expects {}, got {}",
                    plain,
                    handler.type_name,
                    type_name
                );
                continue;
            }
            handler.run(&wire, payload);
        }
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        node: Uuid,
        plain: &str,
        type_name: &str,
        delivery: DeliveryFn,
    ) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);
        {
            let mut plane = self.plane.lock();
            // Re-subscribing with the same signature is a no-op.
            if plane.subscriptions.has(&wire, node, type_name) {
                return Ok(());
            }
            // The filter is in place before subscribe returns.
            plane.filters.insert(wire.clone());
            plane
                .subscriptions
                .add(&wire, HandlerEntry::new(node, type_name, delivery));
        }
        self.discovery.discover(&wire, Flavor::Msg);
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, node: Uuid, plain: &str) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);

        let (removed, still_subscribed, conn_eps) = {
            let mut plane = self.plane.lock();
            let removed = plane.subscriptions.remove_node(&wire, node);
            let still = plane.subscriptions.subscribed(&wire);
            if !still {
                plane.filters.remove(&wire);
            }
            (removed, still, plane.connections.endpoints(&wire))
        };
        if removed == 0 {
            return Ok(());
        }

        for ep in &conn_eps {
            let frame = frame::encode_frame(&[
                wire.as_bytes(),
                self.puuid.as_bytes(),
                node.as_bytes(),
                ControlOp::EndConnection.as_wire_str().as_bytes(),
            ]);
            if let Err(e) = send_one_shot(&ep.ctrl_addr, &frame) {
                log::debug!("[node] END_CONNECTION to {} failed: {}", ep.ctrl_addr, e);
            }
        }

        if !still_subscribed {
            let mut plane = self.plane.lock();
            for ep in &conn_eps {
                plane.connections.del_by_node(&wire, ep.puuid, ep.nuuid);
                if !plane.connections.has_address(&ep.data_addr) {
                    self.drop_sub_conn(&mut plane, &ep.data_addr);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn advertise_service(
        &self,
        node: Uuid,
        plain: &str,
        req_type: &str,
        rep_type: &str,
        handler: Arc<dyn Fn(&[u8]) -> (bool, Vec<u8>) + Send + Sync>,
    ) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);
        {
            let mut plane = self.plane.lock();
            plane.services.entry(wire.clone()).or_default().insert(
                node,
                ServiceRecord {
                    node,
                    req_type: req_type.to_string(),
                    rep_type: rep_type.to_string(),
                    handler,
                },
            );
        }
        self.discovery.advertise(
            Endpoint {
                topic: wire,
                data_addr: self.data_addr.clone(),
                ctrl_addr: self.ctrl_addr.clone(),
                puuid: self.puuid,
                nuuid: node,
                scope: Scope::All,
                req_type: req_type.to_string(),
                rep_type: rep_type.to_string(),
            },
            Flavor::Srv,
        )
    }

    pub(crate) fn unadvertise_service(&self, node: Uuid, plain: &str) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);
        let removed = {
            let mut plane = self.plane.lock();
            let removed = plane
                .services
                .get_mut(&wire)
                .and_then(|nodes| nodes.remove(&node));
            if plane.services.get(&wire).is_some_and(HashMap::is_empty) {
                plane.services.remove(&wire);
            }
            removed
        };
        if let Some(record) = removed {
            self.discovery.unadvertise(
                Endpoint {
                    topic: wire,
                    data_addr: self.data_addr.clone(),
                    ctrl_addr: self.ctrl_addr.clone(),
                    puuid: self.puuid,
                    nuuid: node,
                    scope: Scope::All,
                    req_type: record.req_type,
                    rep_type: record.rep_type,
                },
                Flavor::Srv,
            )?;
        }
        Ok(())
    }

    /// Synchronous service call: local short-circuit, else dispatch or
    /// solicit, then park on the condvar until response or deadline.
    pub(crate) fn request_sync(
        &self,
        node: Uuid,
        plain: &str,
        req_type: &str,
        rep_type: &str,
        payload: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);

        if let Some(record) = self.local_service(&wire) {
            if record.req_type != req_type || record.rep_type != rep_type {
                return Err(Error::TypeMismatch);
            }
            let (ok, bytes) = (record.handler)(&payload);
            return if ok { Ok(bytes) } else { Err(Error::ServiceFailure) };
        }

        let slot = SyncSlot::new();
        let id = self.pending.insert(Pending {
            topic: wire.clone(),
            node,
            req_type: req_type.to_string(),
            rep_type: rep_type.to_string(),
            payload,
            sent: false,
            deadline: Instant::now() + timeout,
            mode: ResponseMode::Sync(Arc::clone(&slot)),
        });
        self.kick_request(id, &wire);

        let outcome = slot.wait(timeout);
        self.pending.remove(id);
        // A completion may have raced the timeout; prefer it.
        match outcome.or_else(|| slot.try_take()) {
            Some((true, bytes)) => Ok(bytes),
            Some((false, _)) => Err(Error::ServiceFailure),
            None => Err(Error::Timeout),
        }
    }

    /// Asynchronous service call: returns once the request is queued.
    pub(crate) fn request_async(
        &self,
        node: Uuid,
        plain: &str,
        req_type: &str,
        rep_type: &str,
        payload: Vec<u8>,
        callback: Box<dyn Fn(AsyncOutcome) + Send + Sync>,
    ) -> Result<()> {
        self.guard_running()?;
        topic::check(plain)?;
        let wire = topic::scoped(&self.partition, plain);

        if let Some(record) = self.local_service(&wire) {
            if record.req_type != req_type || record.rep_type != rep_type {
                // The typed callback is never fed a foreign type.
                log::debug!(
                    "[node] local service [{}] types ({}, {}) do not match request",
                    plain,
                    record.req_type,
                    record.rep_type
                );
                return Ok(());
            }
            let (ok, bytes) = (record.handler)(&payload);
            callback(AsyncOutcome::Reply { ok, payload: bytes });
            return Ok(());
        }

        let id = self.pending.insert(Pending {
            topic: wire.clone(),
            node,
            req_type: req_type.to_string(),
            rep_type: rep_type.to_string(),
            payload,
            sent: false,
            deadline: Instant::now() + crate::config::ASYNC_REQUEST_TIMEOUT,
            mode: ResponseMode::Async(callback),
        });
        self.kick_request(id, &wire);
        Ok(())
    }

    pub(crate) fn topic_list(&self) -> Vec<String> {
        self.discovery.topic_list()
    }

    pub(crate) fn service_list(&self) -> Vec<String> {
        self.discovery.service_list()
    }

    pub(crate) fn service_publishers(&self, plain: &str) -> Vec<Endpoint> {
        let wire = topic::scoped(&self.partition, plain);
        self.discovery.publishers(&wire, Flavor::Srv)
    }

    /// Tear down everything a node registered. Invoked from
    /// `Node::drop`; failures are logged, never surfaced.
    pub(crate) fn drop_node(&self, node: Uuid) {
        let (sub_topics, adv_topics, srv_topics) = {
            let plane = self.plane.lock();
            let subs = plane.subscriptions.topics_of_node(node);
            let advs: Vec<String> = plane
                .topics
                .iter()
                .filter(|(_, nodes)| nodes.contains_key(&node))
                .map(|(t, _)| t.clone())
                .collect();
            let srvs: Vec<String> = plane
                .services
                .iter()
                .filter(|(_, nodes)| nodes.contains_key(&node))
                .map(|(t, _)| t.clone())
                .collect();
            (subs, advs, srvs)
        };

        for wire in sub_topics {
            if let Some(plain) = topic::unscope(&wire) {
                let plain = plain.to_string();
                if let Err(e) = self.unsubscribe(node, &plain) {
                    log::debug!("[node] teardown unsubscribe [{}]: {}", plain, e);
                }
            }
        }
        for wire in adv_topics {
            if let Some(plain) = topic::unscope(&wire) {
                let plain = plain.to_string();
                if let Err(e) = self.unadvertise(node, &plain) {
                    log::debug!("[node] teardown unadvertise [{}]: {}", plain, e);
                }
            }
        }
        for wire in srv_topics {
            if let Some(plain) = topic::unscope(&wire) {
                let plain = plain.to_string();
                if let Err(e) = self.unadvertise_service(node, &plain) {
                    log::debug!("[node] teardown unadvertise service [{}]: {}", plain, e);
                }
            }
        }
    }

    fn local_service(&self, wire: &str) -> Option<ServiceRecord> {
        let plane = self.plane.lock();
        plane.services.get(wire).and_then(|nodes| {
            nodes
                .iter()
                .min_by_key(|(nuuid, _)| **nuuid)
                .map(|(_, record)| record.clone())
        })
    }

    /// Dispatch now if a replier is known, else solicit one. The
    /// solicitation replays already-known endpoints through the
    /// service connection callback, which closes the race with an
    /// advertisement arriving between the check and the solicit.
    fn kick_request(&self, id: u64, wire: &str) {
        if self
            .discovery
            .publishers(wire, Flavor::Srv)
            .is_empty()
        {
            self.discovery.discover(wire, Flavor::Srv);
        } else {
            self.dispatch_request(id);
        }
    }

    /// Send one pending request to the deterministically chosen
    /// replier: lowest `(process, node)` UUID pair.
    fn dispatch_request(&self, id: u64) {
        let Some((wire, node, req_type, rep_type, payload)) = self.pending.take_for_dispatch(id)
        else {
            return;
        };
        let Some(target) = self
            .discovery
            .publishers(&wire, Flavor::Srv)
            .into_iter()
            .min_by(|a, b| (a.puuid, a.nuuid).cmp(&(b.puuid, b.nuuid)))
        else {
            self.pending.mark_unsent(id);
            return;
        };

        let frame = frame::encode_frame(&[
            wire.as_bytes(),
            self.puuid.as_bytes(),
            node.as_bytes(),
            ControlOp::ServiceRequest.as_wire_str().as_bytes(),
            id.to_string().as_bytes(),
            req_type.as_bytes(),
            rep_type.as_bytes(),
            &payload,
            self.ctrl_addr.as_bytes(),
        ]);
        if let Err(e) = send_one_shot(&target.ctrl_addr, &frame) {
            log::debug!(
                "[node] request {} to {} failed: {} (will retry on rediscovery)",
                id,
                target.ctrl_addr,
                e
            );
            self.pending.mark_unsent(id);
        }
    }

    // ===== Discovery event glue =====

    /// Connect-on-discovery: a publisher for a topic we subscribe to
    /// appeared in another process.
    fn on_msg_connection(&self, ep: &Endpoint) {
        if ep.puuid == self.puuid {
            return;
        }

        let notify_nodes: Vec<Uuid> = {
            let mut plane = self.plane.lock();
            if !plane.filters.contains(&ep.topic) {
                return;
            }

            if !plane.sub_tokens.contains_key(&ep.data_addr) {
                let Ok(addr) = ep.data_addr.parse::<SocketAddr>() else {
                    log::debug!("[node] unparsable data address {}", ep.data_addr);
                    return;
                };
                match std::net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            log::debug!("[node] set_nonblocking failed: {}", e);
                            return;
                        }
                        let _ = stream.set_nodelay(true);
                        let mut mio_stream = MioTcpStream::from_std(stream);
                        let token = plane.alloc_token();
                        if let Err(e) =
                            self.registry
                                .register(&mut mio_stream, token, Interest::READABLE)
                        {
                            log::debug!("[node] register subscribe stream failed: {}", e);
                            return;
                        }
                        log::debug!(
                            "[node] connected to publisher {} for [{}]",
                            ep.data_addr,
                            ep.topic
                        );
                        plane.sub_conns.insert(
                            token,
                            SubConn {
                                stream: mio_stream,
                                buf: FrameBuf::new(),
                            },
                        );
                        plane.sub_tokens.insert(ep.data_addr.clone(), token);
                    }
                    Err(e) => {
                        // Discovery heartbeats re-announce; the connect
                        // is retried on the next callback.
                        log::debug!("[node] connect to {} failed: {}", ep.data_addr, e);
                        return;
                    }
                }
            }

            plane.connections.add(ep.clone());

            let mut nodes: Vec<Uuid> = plane
                .subscriptions
                .handlers(&ep.topic)
                .iter()
                .map(|h| h.node)
                .collect();
            nodes.sort();
            nodes.dedup();
            nodes
        };

        // One NEW_CONNECTION per local subscriber node, so the remote
        // publisher's remote-subscribers view can gate its fan-out.
        for node in notify_nodes {
            let frame = frame::encode_frame(&[
                ep.topic.as_bytes(),
                self.puuid.as_bytes(),
                node.as_bytes(),
                ControlOp::NewConnection.as_wire_str().as_bytes(),
            ]);
            if let Err(e) = send_one_shot(&ep.ctrl_addr, &frame) {
                log::debug!("[node] NEW_CONNECTION to {} failed: {}", ep.ctrl_addr, e);
            }
        }
    }

    /// Disconnect-on-discovery: endpoint-level for UNADVERTISE,
    /// process-level (empty topic, nil node) for BYE and TTL expiry.
    fn on_msg_disconnection(&self, ep: &Endpoint) {
        let mut plane = self.plane.lock();
        if !ep.topic.is_empty() && !ep.nuuid.is_nil() {
            plane
                .remote_subscribers
                .del_by_node(&ep.topic, ep.puuid, ep.nuuid);
            if let Some(conn) = plane.connections.del_by_node(&ep.topic, ep.puuid, ep.nuuid) {
                if !plane.connections.has_address(&conn.data_addr) {
                    self.drop_sub_conn(&mut plane, &conn.data_addr);
                }
            }
        } else {
            plane.remote_subscribers.del_by_proc(ep.puuid);
            for conn in plane.connections.del_by_proc(ep.puuid) {
                if !plane.connections.has_address(&conn.data_addr) {
                    self.drop_sub_conn(&mut plane, &conn.data_addr);
                }
            }
        }
    }

    /// A replier appeared: flush requests waiting for one.
    fn on_srv_connection(&self, ep: &Endpoint) {
        for id in self.pending.unsent_for_topic(&ep.topic) {
            self.dispatch_request(id);
        }
    }

    fn on_srv_disconnection(&self, ep: &Endpoint) {
        // In-flight requests toward the vanished replier complete via
        // their timeout.
        log::debug!("[node] service endpoint gone: [{}] {}", ep.topic, ep.puuid);
    }

    fn drop_sub_conn(&self, plane: &mut Plane, data_addr: &str) {
        if let Some(token) = plane.sub_tokens.remove(data_addr) {
            if let Some(mut conn) = plane.sub_conns.remove(&token) {
                let _ = self.registry.deregister(&mut conn.stream);
                log::debug!("[node] disconnected from publisher {}", data_addr);
            }
        }
    }

    // ===== Reception-side processing =====

    fn accept_control(&self) {
        loop {
            let mut plane = self.plane.lock();
            match plane.ctrl_listener.accept() {
                Ok((mut stream, _peer)) => {
                    let token = plane.alloc_token();
                    if let Err(e) = self
                        .registry
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        log::debug!("[rx] register control conn failed: {}", e);
                        continue;
                    }
                    plane.ctrl_conns.insert(
                        token,
                        CtrlConn {
                            stream,
                            buf: FrameBuf::new(),
                        },
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[rx] control accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_publishers(&self) {
        loop {
            let accepted = self.plane.lock().pub_listener.accept();
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = stream.set_nodelay(true);
                    log::debug!("[rx] subscriber connected from {}", peer);
                    self.plane.lock().pub_conns.push(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[rx] publish accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Drain one readable stream, then process its complete frames
    /// with the lock released.
    fn service_stream(&self, token: Token, scratch: &mut [u8]) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let is_sub;
        {
            let mut plane = self.plane.lock();
            let closed = if let Some(conn) = plane.sub_conns.get_mut(&token) {
                is_sub = true;
                drain_stream(&mut conn.stream, &mut conn.buf, scratch, &mut frames)
            } else if let Some(conn) = plane.ctrl_conns.get_mut(&token) {
                is_sub = false;
                drain_stream(&mut conn.stream, &mut conn.buf, scratch, &mut frames)
            } else {
                return;
            };
            if closed {
                self.close_conn(&mut plane, token);
            }
        }

        for body in frames {
            if is_sub {
                self.handle_data_frame(&body);
            } else {
                self.handle_control_frame(&body);
            }
        }
    }

    fn close_conn(&self, plane: &mut Plane, token: Token) {
        if let Some(mut conn) = plane.sub_conns.remove(&token) {
            let _ = self.registry.deregister(&mut conn.stream);
            plane.sub_tokens.retain(|_, t| *t != token);
        } else if let Some(mut conn) = plane.ctrl_conns.remove(&token) {
            let _ = self.registry.deregister(&mut conn.stream);
        }
    }

    /// Data frame: topic, sender data address, payload.
    fn handle_data_frame(&self, body: &[u8]) {
        let parts = match frame::decode_parts(body) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("[rx] dropping data frame: {}", e);
                return;
            }
        };
        if parts.len() != 3 {
            log::debug!("[rx] data frame has {} parts, expected 3", parts.len());
            return;
        }
        let (Ok(wire), Ok(sender)) = (frame::part_str(&parts[0]), frame::part_str(&parts[1]))
        else {
            log::debug!("[rx] data frame with non-UTF-8 header");
            return;
        };
        let payload = &parts[2];

        let (handlers, declared_type) = {
            let plane = self.plane.lock();
            if !plane.filters.contains(wire) {
                log::debug!("[rx] not subscribed to [{}]", wire);
                return;
            }
            let declared = plane
                .connections
                .endpoints(wire)
                .into_iter()
                .find(|e| e.data_addr == sender)
                .map(|e| e.req_type);
            (plane.subscriptions.handlers(wire), declared)
        };

        for handler in handlers {
            if let Some(ref declared) = declared_type {
                if *declared != handler.type_name {
                    log::debug!(
                        "[rx] delivery on [{}] skipped: handler expects {}, publisher sends {}",
                        wire,
                        handler.type_name,
                        declared
                    );
                    continue;
                }
            }
            handler.run(wire, payload);
        }
    }

    /// Control frame: topic, proc UUID, node UUID, opcode, then the
    /// service fields when the opcode is a service op.
    fn handle_control_frame(&self, body: &[u8]) {
        let parts = match frame::decode_parts(body) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("[rx] dropping control frame: {}", e);
                return;
            }
        };
        if parts.len() < 4 {
            log::debug!("[rx] control frame has {} parts, expected >= 4", parts.len());
            return;
        }
        let Ok(wire) = frame::part_str(&parts[0]) else {
            return;
        };
        let (Some(puuid), Some(nuuid)) = (parse_uuid(&parts[1]), parse_uuid(&parts[2])) else {
            log::debug!("[rx] control frame with malformed UUIDs");
            return;
        };
        let Some(op) = frame::part_str(&parts[3]).ok().and_then(ControlOp::from_wire_str) else {
            log::debug!("[rx] control frame with unknown opcode");
            return;
        };

        match op {
            ControlOp::NewConnection => {
                log::debug!("[rx] remote subscriber for [{}]: {}/{}", wire, puuid, nuuid);
                self.plane
                    .lock()
                    .remote_subscribers
                    .add(Endpoint::identity(wire, puuid, nuuid));
            }
            ControlOp::EndConnection => {
                self.plane
                    .lock()
                    .remote_subscribers
                    .del_by_node(wire, puuid, nuuid);
            }
            ControlOp::ServiceRequest => {
                if parts.len() != 9 {
                    log::debug!("[rx] malformed service request ({} parts)", parts.len());
                    return;
                }
                self.serve_request(wire, &parts);
            }
            ControlOp::ServiceResponse => {
                if parts.len() != 9 {
                    log::debug!("[rx] malformed service response ({} parts)", parts.len());
                    return;
                }
                self.complete_request(&parts);
            }
        }
    }

    /// Run the advertised handler and answer on a transient control
    /// connection to the requester.
    fn serve_request(&self, wire: &str, parts: &[Vec<u8>]) {
        let (Ok(req_id), Ok(req_type), Ok(rep_type), Ok(response_addr)) = (
            frame::part_str(&parts[4]),
            frame::part_str(&parts[5]),
            frame::part_str(&parts[6]),
            frame::part_str(&parts[8]),
        ) else {
            log::debug!("[rx] service request with non-UTF-8 fields");
            return;
        };
        let payload = &parts[7];

        let Some(record) = self.local_service(wire) else {
            log::debug!("[rx] no local service for [{}]", wire);
            return;
        };

        // Handler runs outside the plane lock; it may publish.
        let (ok, rep_bytes) = if req_type != record.req_type || rep_type != record.rep_type {
            log::debug!(
                "[rx] request types ({}, {}) do not match service [{}] ({}, {})",
                req_type,
                rep_type,
                wire,
                record.req_type,
                record.rep_type
            );
            (false, Vec::new())
        } else {
            (record.handler)(payload)
        };

        let frame = frame::encode_frame(&[
            wire.as_bytes(),
            self.puuid.as_bytes(),
            record.node.as_bytes(),
            ControlOp::ServiceResponse.as_wire_str().as_bytes(),
            req_id.as_bytes(),
            record.req_type.as_bytes(),
            record.rep_type.as_bytes(),
            &rep_bytes,
            if ok { b"1" } else { b"0" },
        ]);
        if let Err(e) = send_one_shot(response_addr, &frame) {
            log::debug!("[rx] response to {} failed: {}", response_addr, e);
        }
    }

    /// Match a response to its pending request by id.
    fn complete_request(&self, parts: &[Vec<u8>]) {
        let (Ok(id_str), Ok(rep_type), Ok(flag)) = (
            frame::part_str(&parts[4]),
            frame::part_str(&parts[6]),
            frame::part_str(&parts[8]),
        ) else {
            return;
        };
        let Ok(id) = id_str.parse::<u64>() else {
            log::debug!("[rx] response with malformed request id '{}'", id_str);
            return;
        };
        let Some(pending) = self.pending.remove(id) else {
            // Late response after timeout removal: silently discarded.
            log::debug!("[rx] discarding response for unknown request {}", id);
            return;
        };

        let payload = parts[7].clone();
        let ok = flag == "1";

        if rep_type != pending.rep_type {
            match pending.mode {
                ResponseMode::Sync(slot) => slot.complete(false, Vec::new()),
                ResponseMode::Async(_) => log::debug!(
                    "[rx] dropping response for request {}: type {} != expected {}",
                    id,
                    rep_type,
                    pending.rep_type
                ),
            }
            return;
        }

        match pending.mode {
            ResponseMode::Sync(slot) => slot.complete(ok, payload),
            ResponseMode::Async(callback) => callback(AsyncOutcome::Reply { ok, payload }),
        }
    }

    /// The async timeout sweeper, folded into the reception loop.
    fn sweep_async(&self) {
        for id in self.pending.expired_async(Instant::now()) {
            if let Some(pending) = self.pending.remove(id) {
                log::debug!("[rx] async request {} timed out", id);
                if let ResponseMode::Async(callback) = pending.mode {
                    callback(AsyncOutcome::TimedOut);
                }
            }
        }
    }
}

/// Read everything available, reassembling frames. Returns true when
/// the peer closed or the stream is corrupt.
fn drain_stream(
    stream: &mut MioTcpStream,
    buf: &mut FrameBuf,
    scratch: &mut [u8],
    frames: &mut Vec<Vec<u8>>,
) -> bool {
    loop {
        match stream.read(scratch) {
            Ok(0) => return true,
            Ok(n) => {
                buf.extend(&scratch[..n]);
                loop {
                    match buf.next_frame() {
                        Ok(Some(body)) => frames.push(body),
                        Ok(None) => break,
                        Err(e) => {
                            log::debug!("[rx] corrupt stream: {}", e);
                            return true;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("[rx] read error: {}", e);
                return true;
            }
        }
    }
}

fn parse_uuid(part: &[u8]) -> Option<Uuid> {
    let bytes: [u8; 16] = part.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

/// Reception thread body: bounded poll over the subscribe and control
/// sockets, plus the publish-side accepts and the async sweep.
fn reception_loop(inner: Arc<Inner>, mut poll: Poll) {
    log::debug!("[rx] reception thread started proc={}", inner.puuid);
    let mut events = Events::with_capacity(128);
    let mut scratch = vec![0u8; 64 * 1024];

    loop {
        if inner.exit.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                log::debug!("[rx] poll error: {}", e);
            }
            continue;
        }

        for event in events.iter() {
            match event.token() {
                CTRL_LISTENER => inner.accept_control(),
                token => inner.service_stream(token, &mut scratch),
            }
        }

        inner.accept_publishers();
        inner.sweep_async();
    }
    log::debug!("[rx] reception thread exiting proc={}", inner.puuid);
}
