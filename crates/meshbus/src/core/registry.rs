// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address book: `topic -> process -> [endpoint]`.
//!
//! Pure in-memory structure, no I/O. Mutations are idempotent by the
//! `(topic, process, node)` key. Callers serialize access with their
//! own lock; this type performs no locking itself.

use std::collections::HashMap;

use crate::core::guid::Uuid;
use crate::core::types::Endpoint;

/// In-memory index of advertised endpoints.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: HashMap<String, HashMap<Uuid, Vec<Endpoint>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an endpoint. Returns false when an entry with the same
    /// `(topic, process, node)` key already exists.
    pub fn add(&mut self, ep: Endpoint) -> bool {
        let procs = self.entries.entry(ep.topic.clone()).or_default();
        let list = procs.entry(ep.puuid).or_default();
        if list.iter().any(|e| e.nuuid == ep.nuuid) {
            return false;
        }
        list.push(ep);
        true
    }

    /// Remove one endpoint by its full key.
    pub fn del_by_node(&mut self, topic: &str, puuid: Uuid, nuuid: Uuid) -> Option<Endpoint> {
        let procs = self.entries.get_mut(topic)?;
        let list = procs.get_mut(&puuid)?;
        let idx = list.iter().position(|e| e.nuuid == nuuid)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            procs.remove(&puuid);
        }
        if procs.is_empty() {
            self.entries.remove(topic);
        }
        Some(removed)
    }

    /// Remove every endpoint of a process, across all topics.
    /// Returns the removed endpoints.
    pub fn del_by_proc(&mut self, puuid: Uuid) -> Vec<Endpoint> {
        let mut removed = Vec::new();
        self.entries.retain(|_, procs| {
            if let Some(list) = procs.remove(&puuid) {
                removed.extend(list);
            }
            !procs.is_empty()
        });
        removed
    }

    /// All endpoints advertising a topic, flattened across processes.
    pub fn endpoints(&self, topic: &str) -> Vec<Endpoint> {
        self.entries
            .get(topic)
            .map(|procs| procs.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// True when at least one endpoint advertises the topic.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.entries.get(topic).is_some_and(|p| !p.is_empty())
    }

    /// True when any endpoint, on any topic, uses this data address.
    pub fn has_address(&self, addr: &str) -> bool {
        self.entries
            .values()
            .flat_map(|procs| procs.values())
            .flatten()
            .any(|e| e.data_addr == addr)
    }

    /// All topics with at least one endpoint.
    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Endpoints advertised by one process, flattened across topics.
    pub fn endpoints_of_proc(&self, puuid: Uuid) -> Vec<Endpoint> {
        self.entries
            .values()
            .filter_map(|procs| procs.get(&puuid))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
