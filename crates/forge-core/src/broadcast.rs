//! Append-only context log shared by every agent in a session
//!
//! Agents never share mutable state. Instead each call receives the entries
//! published since that agent's previous call ("read since cursor"), so a
//! discovery propagates to every sibling within one invocation cycle.

use crate::types::AgentId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What an entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// The contract being built
    Contract,
    /// A sibling component changed status
    SiblingProgress,
    /// An error signature was fixed
    ResolvedError,
    /// A library or toolchain quirk worth knowing
    KnownIssue,
}

/// One published entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEntry {
    /// Position in the log, starting at 0
    pub seq: u64,
    /// Publish time
    pub at: DateTime<Utc>,
    /// Category
    pub kind: DiscoveryKind,
    /// Publisher (component name or `engine`)
    pub source: String,
    /// Content
    pub message: String,
}

/// Per-session broadcast log with per-agent read cursors
#[derive(Debug, Default)]
pub struct BroadcastLog {
    entries: RwLock<Vec<BroadcastEntry>>,
    cursors: DashMap<AgentId, usize>,
}

impl BroadcastLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning its sequence number
    pub fn publish(&self, kind: DiscoveryKind, source: impl Into<String>, message: impl Into<String>) -> u64 {
        let mut entries = self.entries.write();
        let seq = entries.len() as u64;
        entries.push(BroadcastEntry {
            seq,
            at: Utc::now(),
            kind,
            source: source.into(),
            message: message.into(),
        });
        seq
    }

    /// Entries published since `agent` last read, advancing its cursor
    pub fn read_since(&self, agent: AgentId) -> Vec<BroadcastEntry> {
        let entries = self.entries.read();
        let mut cursor = self.cursors.entry(agent).or_insert(0);
        let start = (*cursor).min(entries.len());
        *cursor = entries.len();
        entries[start..].to_vec()
    }

    /// Full log without touching cursors
    #[must_use]
    pub fn entries(&self) -> Vec<BroadcastEntry> {
        self.entries.read().clone()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Nothing published yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cursors_are_per_agent() {
        let log = BroadcastLog::new();
        let a = AgentId::new();
        let b = AgentId::new();

        log.publish(DiscoveryKind::Contract, "engine", "contract locked");
        assert_eq!(log.read_since(a).len(), 1);

        log.publish(DiscoveryKind::SiblingProgress, "api", "api merged");
        let seen = log.read_since(a);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message, "api merged");
        assert!(log.read_since(a).is_empty());

        // b has never read
        assert_eq!(log.read_since(b).len(), 2);
    }

    #[test]
    fn concurrent_publishers_get_unique_sequence_numbers() {
        let log = Arc::new(BroadcastLog::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|j| log.publish(DiscoveryKind::KnownIssue, format!("t{i}"), format!("{j}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seqs: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 400);
        assert_eq!(log.len(), 400);
    }
}
