use crate::error::LogError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// One audit record. `prev_hash`/`hash` chain every entry to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub session: String,
    pub actor: String,
    pub action: String,
    pub result: String,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

/// Append-only, hash-chained log.
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &self,
        session: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        result: impl Into<String>,
    ) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map(|e| e.hash).unwrap_or([0u8; 32]);
        let mut entry = AuditEntry {
            seq: guard.len() as u64,
            timestamp_ms: now_ms(),
            session: session.into(),
            actor: actor.into(),
            action: action.into(),
            result: result.into(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        guard.push(entry);
        seq
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    pub fn entries_for(&self, session: &str) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.session == session)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn verify_integrity(&self) -> Result<(), LogError> {
        verify_chain(&self.inner.lock())
    }
}

pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), LogError> {
    let mut prev = [0u8; 32];
    for e in entries {
        if e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(LogError::IntegrityViolation(e.seq));
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp_ms.to_le_bytes());
    for field in [&entry.session, &entry.actor, &entry.action, &entry.result] {
        hasher.update(field.as_bytes());
        hasher.update([0]);
    }
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies() {
        let log = AuditLog::new();
        log.append("s1", "driver", "phase INIT -> PARALLEL_BUILD", "ok");
        log.append("s1", "agent-ui", "generate ui", "3 files");
        log.append("s2", "driver", "phase INTENT_LOCK -> INIT", "ok");
        assert_eq!(log.len(), 3);
        assert!(log.verify_integrity().is_ok());
        assert_eq!(log.entries_for("s1").len(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let log = AuditLog::new();
        log.append("s1", "driver", "a", "ok");
        log.append("s1", "driver", "b", "ok");
        let mut entries = log.entries();
        entries[0].result = "forged".into();
        assert_eq!(verify_chain(&entries), Err(LogError::IntegrityViolation(0)));
    }
}
