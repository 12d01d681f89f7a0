// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The public participant surface.
//!
//! A [`Node`] is a lightweight facade over a shared [`Runtime`]:
//! advertise/publish/subscribe on topics, advertise and call services
//! synchronously or asynchronously, and introspect what discovery has
//! learned. Multiple nodes share one runtime (and its process UUID);
//! each node carries its own node UUID.
//!
//! Dropping a node unsubscribes and unadvertises everything it
//! registered.

mod runtime;
#[cfg(test)]
mod tests;

pub use runtime::Runtime;

use std::sync::Arc;
use std::time::Duration;

use crate::core::guid::Uuid;
use crate::core::subscription::DeliveryFn;
use crate::core::types::{Endpoint, Scope};
use crate::error::{Error, Result};
use crate::payload::msgs::Empty;
use crate::payload::Payload;
use crate::rpc::AsyncOutcome;
use runtime::Inner;

/// Information about one process advertising a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePublisher {
    /// Plain (partition-stripped) service topic.
    pub topic: String,
    /// Control endpoint requests are sent to.
    pub ctrl_addr: String,
    /// Advertising process.
    pub puuid: Uuid,
    /// Advertising node.
    pub nuuid: Uuid,
    req_type: String,
    rep_type: String,
}

impl ServicePublisher {
    /// Declared request type descriptor.
    pub fn req_type_name(&self) -> &str {
        &self.req_type
    }

    /// Declared response type descriptor.
    pub fn rep_type_name(&self) -> &str {
        &self.rep_type
    }

    fn from_endpoint(plain: &str, ep: &Endpoint) -> Self {
        Self {
            topic: plain.to_string(),
            ctrl_addr: ep.ctrl_addr.clone(),
            puuid: ep.puuid,
            nuuid: ep.nuuid,
            req_type: ep.req_type.clone(),
            rep_type: ep.rep_type.clone(),
        }
    }
}

/// A logical participant. Cheap to create; all heavy state lives in
/// the [`Runtime`].
pub struct Node {
    inner: Arc<Inner>,
    nuuid: Uuid,
}

impl Node {
    /// Create a node on a runtime.
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            inner: runtime.inner_arc(),
            nuuid: Uuid::generate(),
        }
    }

    /// This node's UUID.
    pub fn node_uuid(&self) -> Uuid {
        self.nuuid
    }

    /// Announce this node as a publisher of `topic` with payload type
    /// `T`. Re-advertising an already advertised topic is a no-op for
    /// observers.
    pub fn advertise<T: Payload>(&self, topic: &str, scope: Scope) -> Result<()> {
        self.inner
            .advertise(self.nuuid, topic, T::type_name(), scope)
    }

    /// Withdraw a topic advertisement.
    pub fn unadvertise(&self, topic: &str) -> Result<()> {
        self.inner.unadvertise(self.nuuid, topic)
    }

    /// Publish one message. The topic must have been advertised by
    /// this node with the same payload type. Publishing with no
    /// subscribers anywhere is a successful no-op.
    pub fn publish<T: Payload>(&self, topic: &str, msg: &T) -> Result<()> {
        let payload = msg.encode()?;
        self.inner
            .publish(self.nuuid, topic, T::type_name(), &payload)
    }

    /// Register a callback for `topic`. The callback runs on the
    /// reception thread for remote publishers and on the publisher's
    /// thread for same-process publishers; it may publish or issue
    /// requests itself.
    pub fn subscribe<T, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        T: Payload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let plain = topic.to_string();
        let delivery: DeliveryFn = Arc::new(move |_wire, payload| match T::decode(payload) {
            Ok(msg) => callback(&msg),
            Err(e) => {
                // Per-handler failure: this delivery is dropped, other
                // handlers on the topic still run.
                log::debug!("[node] dropping delivery on [{}]: {}", plain, e);
            }
        });
        self.inner
            .subscribe(self.nuuid, topic, T::type_name(), delivery)
    }

    /// Remove every callback this node registered for `topic`.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.unsubscribe(self.nuuid, topic)
    }

    /// Advertise a service. The handler maps a request to a response;
    /// returning `Err` reports failure to the requester.
    pub fn advertise_service<Req, Rep, F>(&self, topic: &str, handler: F) -> Result<()>
    where
        Req: Payload,
        Rep: Payload,
        F: Fn(&Req) -> Result<Rep> + Send + Sync + 'static,
    {
        let plain = topic.to_string();
        let erased = Arc::new(move |req_bytes: &[u8]| -> (bool, Vec<u8>) {
            let req = match Req::decode(req_bytes) {
                Ok(req) => req,
                Err(e) => {
                    log::debug!("[node] service [{}] request decode failed: {}", plain, e);
                    return (false, Vec::new());
                }
            };
            match handler(&req).map(|rep| rep.encode()) {
                Ok(Ok(bytes)) => (true, bytes),
                Ok(Err(e)) => {
                    log::debug!("[node] service [{}] response encode failed: {}", plain, e);
                    (false, Vec::new())
                }
                Err(_) => (false, Vec::new()),
            }
        });
        self.inner.advertise_service(
            self.nuuid,
            topic,
            Req::type_name(),
            Rep::type_name(),
            erased,
        )
    }

    /// Withdraw a service advertisement.
    pub fn unadvertise_service(&self, topic: &str) -> Result<()> {
        self.inner.unadvertise_service(self.nuuid, topic)
    }

    /// Synchronous service call. Waits up to `timeout` for the
    /// response; an unknown service keeps soliciting via discovery
    /// until the deadline. Errors map the protocol outcomes:
    /// [`Error::Timeout`], [`Error::ServiceFailure`],
    /// [`Error::TypeMismatch`].
    pub fn request<Req, Rep>(&self, topic: &str, req: &Req, timeout: Duration) -> Result<Rep>
    where
        Req: Payload,
        Rep: Payload,
    {
        let payload = req.encode()?;
        let rep_bytes = self.inner.request_sync(
            self.nuuid,
            topic,
            Req::type_name(),
            Rep::type_name(),
            payload,
            timeout,
        )?;
        Rep::decode(&rep_bytes)
    }

    /// Asynchronous service call. Returns once the request is queued;
    /// the callback fires on the reception thread with the decoded
    /// response, or with [`Error::Timeout`]/[`Error::ServiceFailure`].
    /// A response of the wrong type never reaches the callback.
    pub fn request_async<Req, Rep, F>(&self, topic: &str, req: &Req, callback: F) -> Result<()>
    where
        Req: Payload,
        Rep: Payload,
        F: Fn(Result<Rep>) + Send + Sync + 'static,
    {
        let plain = topic.to_string();
        let erased: Box<dyn Fn(AsyncOutcome) + Send + Sync> =
            Box::new(move |outcome| match outcome {
                AsyncOutcome::Reply { ok: true, payload } => match Rep::decode(&payload) {
                    Ok(rep) => callback(Ok(rep)),
                    Err(e) => {
                        log::debug!("[node] response decode on [{}] failed: {}", plain, e);
                    }
                },
                AsyncOutcome::Reply { ok: false, .. } => callback(Err(Error::ServiceFailure)),
                AsyncOutcome::TimedOut => callback(Err(Error::Timeout)),
            });
        self.inner.request_async(
            self.nuuid,
            topic,
            Req::type_name(),
            Rep::type_name(),
            req.encode()?,
            erased,
        )
    }

    /// No-input synchronous call: the request is the canonical empty
    /// payload.
    pub fn request_no_input<Rep: Payload>(&self, topic: &str, timeout: Duration) -> Result<Rep> {
        self.request::<Empty, Rep>(topic, &Empty, timeout)
    }

    /// No-input asynchronous call.
    pub fn request_no_input_async<Rep, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        Rep: Payload,
        F: Fn(Result<Rep>) + Send + Sync + 'static,
    {
        self.request_async::<Empty, Rep, F>(topic, &Empty, callback)
    }

    /// Plain names of every topic discovery knows about. The first
    /// call may block briefly while discovery initializes.
    pub fn topic_list(&self) -> Vec<String> {
        self.inner.topic_list()
    }

    /// Plain names of every known service.
    pub fn service_list(&self) -> Vec<String> {
        self.inner.service_list()
    }

    /// Every known publisher of a service, with its declared types.
    /// Empty when the service is unknown.
    pub fn service_info(&self, topic: &str) -> Vec<ServicePublisher> {
        self.inner
            .service_publishers(topic)
            .iter()
            .map(|ep| ServicePublisher::from_endpoint(topic, ep))
            .collect()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.drop_node(self.nuuid);
    }
}
