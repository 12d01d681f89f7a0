// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic validation and partition scoping.
//!
//! Every topic travels the wire as `@{partition}@{topic}`; two
//! processes with different partitions therefore never match, even on
//! the same multicast group.

use crate::error::{Error, Result};

/// A topic is valid when it is non-empty and free of the reserved
/// characters used by the scoping format and of whitespace.
pub fn is_valid(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains('@') && !topic.contains(char::is_whitespace)
}

/// Validate a user-supplied topic.
pub fn check(topic: &str) -> Result<()> {
    if is_valid(topic) {
        Ok(())
    } else {
        Err(Error::InvalidTopic(topic.to_string()))
    }
}

/// Fully qualified wire form of a topic.
pub fn scoped(partition: &str, topic: &str) -> String {
    format!("@{}@{}", partition, topic)
}

/// Prefix shared by every topic of a partition.
pub fn partition_prefix(partition: &str) -> String {
    format!("@{}@", partition)
}

/// Strip the partition prefix, returning the plain topic.
pub fn unscope(wire_topic: &str) -> Option<&str> {
    let rest = wire_topic.strip_prefix('@')?;
    let at = rest.find('@')?;
    Some(&rest[at + 1..])
}
