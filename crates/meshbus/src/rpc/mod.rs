// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service-call engine data structures.
//!
//! Pending requests are correlated by a process-unique numeric id.
//! Synchronous requests park on a [`SyncSlot`] (mutex + condvar, the
//! predicate is "response arrived or timeout"); asynchronous requests
//! carry a type-erased callback invoked by the reception thread. The
//! encoded request travels with the entry so a request issued before
//! discovery converged can be dispatched once the service appears.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::core::guid::Uuid;

/// Completion slot for a synchronous request. Single waiter, single
/// notifier, spurious wakeups tolerated.
#[derive(Default)]
pub struct SyncSlot {
    state: Mutex<Option<(bool, Vec<u8>)>>,
    cv: Condvar,
}

impl SyncSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver the outcome and wake the waiter.
    pub fn complete(&self, ok: bool, payload: Vec<u8>) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some((ok, payload));
        }
        self.cv.notify_one();
    }

    /// Wait up to `timeout` for completion.
    pub fn wait(&self, timeout: Duration) -> Option<(bool, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.take() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let result = self.cv.wait_for(&mut state, deadline - now);
            if result.timed_out() {
                // One final check covers a notify that raced the timeout.
                return state.take();
            }
        }
    }

    /// Drain a completion that raced the waiter's removal of the entry.
    pub fn try_take(&self) -> Option<(bool, Vec<u8>)> {
        self.state.lock().take()
    }
}

/// What the reception thread reports to an asynchronous requester.
pub enum AsyncOutcome {
    /// A type-matched response arrived.
    Reply { ok: bool, payload: Vec<u8> },
    /// The sweeper expired the entry.
    TimedOut,
}

/// Delivery mode of a pending request.
pub enum ResponseMode {
    Sync(Arc<SyncSlot>),
    Async(Box<dyn Fn(AsyncOutcome) + Send + Sync>),
}

/// One in-flight service request.
pub struct Pending {
    /// Partition-scoped service topic.
    pub topic: String,
    /// Requesting node.
    pub node: Uuid,
    /// Declared request type descriptor.
    pub req_type: String,
    /// Expected response type descriptor.
    pub rep_type: String,
    /// Encoded request, kept for deferred dispatch.
    pub payload: Vec<u8>,
    /// Whether the request reached a replier already.
    pub sent: bool,
    /// Absolute deadline (used by the async sweeper).
    pub deadline: Instant,
    pub mode: ResponseMode,
}

/// Table of in-flight requests, keyed by process-unique id.
#[derive(Default)]
pub struct PendingBook {
    table: DashMap<u64, Pending>,
    next_id: AtomicU64,
}

impl PendingBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending entry, returning its fresh id.
    pub fn insert(&self, pending: Pending) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.table.insert(id, pending);
        id
    }

    /// Remove and return an entry; the caller completes or discards it.
    pub fn remove(&self, id: u64) -> Option<Pending> {
        self.table.remove(&id).map(|(_, p)| p)
    }

    /// Ids of entries for a topic that were never dispatched.
    pub fn unsent_for_topic(&self, wire_topic: &str) -> Vec<u64> {
        self.table
            .iter()
            .filter(|entry| !entry.value().sent && entry.value().topic == wire_topic)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Snapshot the fields needed to build a request frame, marking
    /// the entry as dispatched.
    pub fn take_for_dispatch(&self, id: u64) -> Option<(String, Uuid, String, String, Vec<u8>)> {
        let mut entry = self.table.get_mut(&id)?;
        entry.sent = true;
        Some((
            entry.topic.clone(),
            entry.node,
            entry.req_type.clone(),
            entry.rep_type.clone(),
            entry.payload.clone(),
        ))
    }

    /// Revert an entry to undispatched, so the next discovery event
    /// retries it. Used when the one-shot send to a replier fails.
    pub fn mark_unsent(&self, id: u64) {
        if let Some(mut entry) = self.table.get_mut(&id) {
            entry.sent = false;
        }
    }

    /// Ids of expired asynchronous entries. Synchronous waiters own
    /// their timeout and are never swept.
    pub fn expired_async(&self, now: Instant) -> Vec<u64> {
        self.table
            .iter()
            .filter(|entry| {
                matches!(entry.value().mode, ResponseMode::Async(_)) && now >= entry.value().deadline
            })
            .map(|entry| *entry.key())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

/// A locally advertised service.
#[derive(Clone)]
pub struct ServiceRecord {
    pub node: Uuid,
    pub req_type: String,
    pub rep_type: String,
    /// `(request bytes) -> (result flag, response bytes)`.
    pub handler: Arc<dyn Fn(&[u8]) -> (bool, Vec<u8>) + Send + Sync>,
}

impl std::fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("node", &self.node)
            .field("req_type", &self.req_type)
            .field("rep_type", &self.rep_type)
            .finish()
    }
}
