// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription handler table: `topic -> node -> handler id -> entry`.
//!
//! Entries carry the declared type descriptor and a type-erased
//! callback that decodes the payload and invokes the user closure.
//! Decode failures are per-handler: the handler logs and skips, other
//! handlers on the topic still run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::guid::Uuid;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased delivery callback: `(topic, payload bytes)`.
pub type DeliveryFn = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// One registered subscription callback.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Node that registered the handler.
    pub node: Uuid,
    /// Process-unique handler id.
    pub id: u64,
    /// Declared payload type descriptor.
    pub type_name: String,
    cb: DeliveryFn,
}

impl HandlerEntry {
    pub fn new(node: Uuid, type_name: &str, cb: DeliveryFn) -> Self {
        Self {
            node,
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            type_name: type_name.to_string(),
            cb,
        }
    }

    /// Run the callback. Decoding happens inside the erased closure.
    pub fn run(&self, topic: &str, payload: &[u8]) {
        (self.cb)(topic, payload);
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("node", &self.node)
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// In-memory index of local subscription callbacks.
#[derive(Debug, Default)]
pub struct HandlerTable {
    topics: HashMap<String, HashMap<Uuid, HashMap<u64, HandlerEntry>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, topic: &str, entry: HandlerEntry) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .entry(entry.node)
            .or_default()
            .insert(entry.id, entry);
    }

    /// True when this node already holds a handler of this signature
    /// for the topic. Re-subscribing with the same signature is a
    /// no-op at the facade.
    pub fn has(&self, topic: &str, node: Uuid, type_name: &str) -> bool {
        self.topics
            .get(topic)
            .and_then(|nodes| nodes.get(&node))
            .is_some_and(|handlers| handlers.values().any(|h| h.type_name == type_name))
    }

    /// True when any handler is registered for the topic.
    pub fn subscribed(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|nodes| {
            nodes.values().any(|handlers| !handlers.is_empty())
        })
    }

    /// Snapshot of every handler for a topic. Entries are cheap clones
    /// (the callback is behind an `Arc`), so callers can invoke them
    /// after releasing the table's lock.
    pub fn handlers(&self, topic: &str) -> Vec<HandlerEntry> {
        self.topics
            .get(topic)
            .map(|nodes| nodes.values().flat_map(|h| h.values()).cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every handler a node registered for a topic.
    /// Returns how many were removed.
    pub fn remove_node(&mut self, topic: &str, node: Uuid) -> usize {
        let Some(nodes) = self.topics.get_mut(topic) else {
            return 0;
        };
        let removed = nodes.remove(&node).map(|h| h.len()).unwrap_or(0);
        if nodes.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Topics a node currently subscribes to. Node teardown walks
    /// this list and unsubscribes per topic, so publishers get their
    /// END_CONNECTION notifications.
    pub fn topics_of_node(&self, node: Uuid) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, nodes)| nodes.contains_key(&node))
            .map(|(t, _)| t.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_entry(node: Uuid, hits: Arc<AtomicUsize>) -> HandlerEntry {
        HandlerEntry::new(
            node,
            "meshbus.msgs.Int32",
            Arc::new(move |_topic, _payload| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn add_and_run() {
        let mut table = HandlerTable::new();
        let node = Uuid::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add("/t", counting_entry(node, Arc::clone(&hits)));

        assert!(table.subscribed("/t"));
        assert!(!table.subscribed("/u"));

        for h in table.handlers("/t") {
            h.run("/t", &[0, 0, 0, 0]);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_snapshot_entry_per_registration() {
        let mut table = HandlerTable::new();
        let node = Uuid::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add("/t", counting_entry(node, Arc::clone(&hits)));
        table.add("/t", counting_entry(node, Arc::clone(&hits)));
        assert_eq!(table.handlers("/t").len(), 2);
    }

    #[test]
    fn remove_node_prunes_topic() {
        let mut table = HandlerTable::new();
        let node = Uuid::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add("/t", counting_entry(node, Arc::clone(&hits)));

        assert_eq!(table.remove_node("/t", node), 1);
        assert!(!table.subscribed("/t"));
        assert_eq!(table.remove_node("/t", node), 0);
    }

    #[test]
    fn topics_of_node_lists_only_that_node() {
        let mut table = HandlerTable::new();
        let a = Uuid::generate();
        let b = Uuid::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        table.add("/t", counting_entry(a, Arc::clone(&hits)));
        table.add("/u", counting_entry(a, Arc::clone(&hits)));
        table.add("/u", counting_entry(b, Arc::clone(&hits)));

        let mut topics = table.topics_of_node(a);
        topics.sort();
        assert_eq!(topics, vec!["/t".to_string(), "/u".to_string()]);
        assert_eq!(table.topics_of_node(b), vec!["/u".to_string()]);

        // teardown path: per-topic removal drains the node's entries
        for topic in topics {
            table.remove_node(&topic, a);
        }
        assert!(table.topics_of_node(a).is_empty());
        assert!(table.subscribed("/u"));
        assert!(!table.subscribed("/t"));
    }
}
