//! Session persistence
//!
//! Contracts, sessions, verification results and escalation records are
//! saved as the driver goes so a session can be resumed after a restart.
//! Verification results and escalation records are append-only; loading
//! escalation records keeps the latest state of each record.

use crate::contract::IntentContract;
use crate::error::{ForgeError, ForgeResult};
use crate::escalation::EscalationRecord;
use crate::session::BuildSession;
use crate::swarm::VerificationResult;
use crate::types::{ContractId, SessionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Storage port
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Save a locked contract; saving different content under a known id fails
    async fn save_contract(&self, contract: &IntentContract) -> ForgeResult<()>;
    /// Load a contract
    async fn load_contract(&self, id: ContractId) -> ForgeResult<Option<IntentContract>>;
    /// Upsert a session
    async fn save_session(&self, session: &BuildSession) -> ForgeResult<()>;
    /// Load a session
    async fn load_session(&self, id: SessionId) -> ForgeResult<Option<BuildSession>>;
    /// Every stored session id
    async fn list_sessions(&self) -> ForgeResult<Vec<SessionId>>;
    /// Append a verification result
    async fn append_verification(&self, session: SessionId, result: &VerificationResult) -> ForgeResult<()>;
    /// All verification results of a session, oldest first
    async fn load_verifications(&self, session: SessionId) -> ForgeResult<Vec<VerificationResult>>;
    /// Append a state of an escalation record
    async fn append_escalation(&self, record: &EscalationRecord) -> ForgeResult<()>;
    /// Latest state of every escalation record of a session, in creation order
    async fn load_escalations(&self, session: SessionId) -> ForgeResult<Vec<EscalationRecord>>;
}

fn latest_per_record(records: Vec<EscalationRecord>) -> Vec<EscalationRecord> {
    let mut order = Vec::new();
    let mut latest = HashMap::new();
    for record in records {
        if !latest.contains_key(&record.id) {
            order.push(record.id);
        }
        latest.insert(record.id, record);
    }
    order.into_iter().filter_map(|id| latest.remove(&id)).collect()
}

fn ensure_same_contract(existing: &IntentContract, incoming: &IntentContract) -> ForgeResult<()> {
    if existing.content_hash() == incoming.content_hash() {
        Ok(())
    } else {
        Err(ForgeError::ContractLocked(incoming.id().to_string()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    contracts: HashMap<ContractId, IntentContract>,
    sessions: HashMap<SessionId, BuildSession>,
    verifications: HashMap<SessionId, Vec<VerificationResult>>,
    escalations: HashMap<SessionId, Vec<EscalationRecord>>,
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_contract(&self, contract: &IntentContract) -> ForgeResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.contracts.get(&contract.id()) {
            return ensure_same_contract(existing, contract);
        }
        state.contracts.insert(contract.id(), contract.clone());
        Ok(())
    }

    async fn load_contract(&self, id: ContractId) -> ForgeResult<Option<IntentContract>> {
        Ok(self.state.lock().contracts.get(&id).cloned())
    }

    async fn save_session(&self, session: &BuildSession) -> ForgeResult<()> {
        self.state.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load_session(&self, id: SessionId) -> ForgeResult<Option<BuildSession>> {
        Ok(self.state.lock().sessions.get(&id).cloned())
    }

    async fn list_sessions(&self) -> ForgeResult<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.state.lock().sessions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_verification(&self, session: SessionId, result: &VerificationResult) -> ForgeResult<()> {
        self.state
            .lock()
            .verifications
            .entry(session)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn load_verifications(&self, session: SessionId) -> ForgeResult<Vec<VerificationResult>> {
        Ok(self
            .state
            .lock()
            .verifications
            .get(&session)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_escalation(&self, record: &EscalationRecord) -> ForgeResult<()> {
        self.state
            .lock()
            .escalations
            .entry(record.session_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_escalations(&self, session: SessionId) -> ForgeResult<Vec<EscalationRecord>> {
        let records = self
            .state
            .lock()
            .escalations
            .get(&session)
            .cloned()
            .unwrap_or_default();
        Ok(latest_per_record(records))
    }
}

/// JSON files under a root directory
///
/// ```text
/// root/contracts/<id>.json
/// root/sessions/<id>.json
/// root/verifications/<session>.jsonl
/// root/escalations/<session>.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `root`; directories are created lazily
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file(&self, dir: &str, name: impl std::fmt::Display, ext: &str) -> PathBuf {
        self.root.join(dir).join(format!("{name}.{ext}"))
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> ForgeResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(persist_err)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        // Write-then-rename so a crash never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(persist_err)
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> ForgeResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(persist_err),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persist_err(e)),
        }
    }

    async fn append_line<T: Serialize + Sync>(&self, path: &Path, value: &T) -> ForgeResult<()> {
        let mut line = serde_json::to_vec(value).map_err(persist_err)?;
        line.push(b'\n');
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(persist_err)?;
        file.write_all(&line).await.map_err(persist_err)?;
        file.flush().await.map_err(persist_err)
    }

    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> ForgeResult<Vec<T>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persist_err(e)),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(persist_err))
            .collect()
    }
}

fn persist_err(err: impl std::fmt::Display) -> ForgeError {
    ForgeError::Persistence(err.to_string())
}

#[async_trait]
impl Persistence for JsonFileStore {
    async fn save_contract(&self, contract: &IntentContract) -> ForgeResult<()> {
        let path = self.file("contracts", contract.id(), "json");
        if let Some(existing) = self.read_json::<IntentContract>(&path).await? {
            return ensure_same_contract(&existing, contract);
        }
        self.write_json(&path, contract).await
    }

    async fn load_contract(&self, id: ContractId) -> ForgeResult<Option<IntentContract>> {
        self.read_json(&self.file("contracts", id, "json")).await
    }

    async fn save_session(&self, session: &BuildSession) -> ForgeResult<()> {
        self.write_json(&self.file("sessions", session.id, "json"), session)
            .await
    }

    async fn load_session(&self, id: SessionId) -> ForgeResult<Option<BuildSession>> {
        self.read_json(&self.file("sessions", id, "json")).await
    }

    async fn list_sessions(&self) -> ForgeResult<Vec<SessionId>> {
        let dir = self.root.join("sessions");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persist_err(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(persist_err)? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<SessionId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn append_verification(&self, session: SessionId, result: &VerificationResult) -> ForgeResult<()> {
        self.append_line(&self.file("verifications", session, "jsonl"), result)
            .await
    }

    async fn load_verifications(&self, session: SessionId) -> ForgeResult<Vec<VerificationResult>> {
        self.read_lines(&self.file("verifications", session, "jsonl"))
            .await
    }

    async fn append_escalation(&self, record: &EscalationRecord) -> ForgeResult<()> {
        self.append_line(&self.file("escalations", record.session_id, "jsonl"), record)
            .await
    }

    async fn load_escalations(&self, session: SessionId) -> ForgeResult<Vec<EscalationRecord>> {
        let records = self
            .read_lines(&self.file("escalations", session, "jsonl"))
            .await?;
        Ok(latest_per_record(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{CriterionDraft, VerificationMethod};
    use crate::escalation::{EscalationLevel, EscalationOutcome};
    use crate::swarm::{Finding, SwarmMode};
    use crate::types::{EscalationId, ResultId};
    use forge_artifact::WorkspacePath;

    fn contract() -> IntentContract {
        let mut c = IntentContract::draft("app");
        c.add_criterion(CriterionDraft {
            description: "has index".into(),
            method: Some(VerificationMethod::FileExists {
                path: WorkspacePath::new("index.html").unwrap(),
            }),
        })
        .unwrap();
        c.lock().unwrap();
        c
    }

    fn record(session: SessionId, id: EscalationId, outcome: EscalationOutcome) -> EscalationRecord {
        EscalationRecord {
            id,
            session_id: session,
            level: EscalationLevel::LocalFix,
            signature: "verification:placeholder:todo-marker".into(),
            attempt: 1,
            outcome,
            trigger: "TODO in src/a.ts".into(),
            at: chrono::Utc::now(),
        }
    }

    fn result(checker: &str) -> VerificationResult {
        VerificationResult {
            id: ResultId::new(),
            checker: checker.into(),
            passed: false,
            score: None,
            findings: vec![Finding::internal_error("boom")],
            mode: SwarmMode::Authoritative,
            at: chrono::Utc::now(),
            duration_ms: 3,
        }
    }

    async fn exercise(store: &dyn Persistence) {
        let contract = contract();
        store.save_contract(&contract).await.unwrap();
        store.save_contract(&contract).await.unwrap();
        assert_eq!(store.load_contract(contract.id()).await.unwrap(), Some(contract.clone()));

        let session = BuildSession::new(contract.id());
        store.save_session(&session).await.unwrap();
        assert_eq!(store.load_session(session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(store.list_sessions().await.unwrap(), vec![session.id]);

        store.append_verification(session.id, &result("security")).await.unwrap();
        store.append_verification(session.id, &result("security")).await.unwrap();
        assert_eq!(store.load_verifications(session.id).await.unwrap().len(), 2);

        let id = EscalationId::new();
        store
            .append_escalation(&record(session.id, id, EscalationOutcome::Pending))
            .await
            .unwrap();
        store
            .append_escalation(&record(session.id, id, EscalationOutcome::Resolved))
            .await
            .unwrap();
        let loaded = store.load_escalations(session.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].outcome, EscalationOutcome::Resolved);
    }

    #[tokio::test]
    async fn memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&JsonFileStore::new(dir.path())).await;
        assert!(dir.path().join("sessions").is_dir());
    }

    #[tokio::test]
    async fn contract_ids_are_never_reused() {
        let store = MemoryStore::new();
        let contract = contract();
        store.save_contract(&contract).await.unwrap();

        let mut value = serde_json::to_value(&contract).unwrap();
        value["criteria"][0]["description"] = "changed".into();
        let forged: IntentContract = serde_json::from_value(value).unwrap();
        assert!(matches!(
            store.save_contract(&forged).await,
            Err(ForgeError::ContractLocked(_))
        ));
    }
}
