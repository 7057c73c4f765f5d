//! Shared merged workspace
//!
//! The only global mutable state of a session. It is changed solely through
//! [`SharedWorkspace::merge`], which validates every change set against the
//! ownership claims before staging, holds a single merge lock, mirrors the
//! files into the shared sandbox and commits a new snapshot revision. A
//! cancelled or failed merge restores the sandbox from the base snapshot and
//! commits nothing.

use crate::error::{ForgeError, ForgeResult};
use crate::ports::{VersionStore, WorkspaceSandbox};
use async_trait::async_trait;
use forge_artifact::{ChangeSet, RevisionId, RevisionInfo, Snapshot, SnapshotArena, WorkspacePath};
use forge_composition::{CompositionStrategy, OwnershipClaims, SingleWriterStrategy};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A committed merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReceipt {
    /// New head
    pub revision: RevisionId,
    /// Paths written or deleted
    pub paths: Vec<WorkspacePath>,
    /// Owners whose sets were merged
    pub owners: Vec<String>,
}

/// Snapshot arena, claims and shared sandbox behind one merge lock
pub struct SharedWorkspace {
    arena: RwLock<SnapshotArena>,
    claims: RwLock<OwnershipClaims>,
    strategy: Box<dyn CompositionStrategy>,
    sandbox: Arc<dyn WorkspaceSandbox>,
    merge_lock: Mutex<()>,
}

impl fmt::Debug for SharedWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWorkspace")
            .field("head", &self.head())
            .field("claims", &self.claims.read().len())
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

impl SharedWorkspace {
    /// Empty workspace mirrored into `sandbox`
    #[must_use]
    pub fn new(sandbox: Arc<dyn WorkspaceSandbox>) -> Self {
        Self {
            arena: RwLock::new(SnapshotArena::new()),
            claims: RwLock::new(OwnershipClaims::new()),
            strategy: Box::new(SingleWriterStrategy::new()),
            sandbox,
            merge_lock: Mutex::new(()),
        }
    }

    /// With a different composition strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn CompositionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Claim `paths` for `owner`
    ///
    /// # Errors
    /// [`ForgeError::FileConflict`] if another owner holds any of them
    pub fn register_claims<'a>(
        &self,
        owner: &str,
        paths: impl IntoIterator<Item = &'a WorkspacePath>,
    ) -> ForgeResult<()> {
        self.claims
            .write()
            .claim(owner, paths)
            .map_err(|e| ForgeError::file_conflict(owner, e))
    }

    /// Drop `owner`'s claims
    pub fn release_claims(&self, owner: &str) -> BTreeSet<WorkspacePath> {
        self.claims.write().release(owner)
    }

    /// Owner of a claimed path
    #[must_use]
    pub fn owner_of(&self, path: &WorkspacePath) -> Option<String> {
        self.claims.read().owner_of(path).map(str::to_string)
    }

    /// Current head snapshot
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.arena.read().head()
    }

    /// Snapshot at a past revision
    ///
    /// # Errors
    /// [`ForgeError::Arena`] for unknown revisions
    pub fn snapshot_at(&self, revision: RevisionId) -> ForgeResult<Snapshot> {
        Ok(self.arena.read().snapshot(revision)?)
    }

    /// Head revision
    #[must_use]
    pub fn head(&self) -> RevisionId {
        self.arena.read().head_id()
    }

    /// Every revision, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<RevisionInfo> {
        self.arena.read().history().cloned().collect()
    }

    /// The shared sandbox
    #[must_use]
    pub fn sandbox(&self) -> Arc<dyn WorkspaceSandbox> {
        Arc::clone(&self.sandbox)
    }

    /// Atomically merge `sets`
    ///
    /// # Errors
    /// - [`ForgeError::FileConflict`] before anything is written
    /// - [`ForgeError::AbortRequested`] if `cancel` fires; the sandbox is
    ///   restored and no revision is committed
    /// - [`ForgeError::Sandbox`] if mirroring fails; restored the same way
    pub async fn merge(
        &self,
        sets: &[ChangeSet],
        message: &str,
        cancel: &CancellationToken,
    ) -> ForgeResult<MergeReceipt> {
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ForgeError::AbortRequested),
            guard = self.merge_lock.lock() => guard,
        };

        let base = self.snapshot();
        let refs: Vec<&ChangeSet> = sets.iter().collect();
        let owners: Vec<String> = sets.iter().map(|s| s.owner().to_string()).collect();
        {
            let claims = self.claims.read();
            self.strategy
                .validate(&base, &claims, &refs)
                .map_err(|e| ForgeError::file_conflict(owners.join(","), e))?;
        }

        let mut staging = self.arena.read().stage();
        for set in sets {
            staging.apply(set);
        }

        let mut touched: Vec<WorkspacePath> = Vec::new();
        let mut mirrored: ForgeResult<()> = Ok(());
        'sets: for set in sets {
            for (path, data) in set.entries() {
                if cancel.is_cancelled() {
                    mirrored = Err(ForgeError::AbortRequested);
                    break 'sets;
                }
                touched.push(path.clone());
                let write = async {
                    match data {
                        Some(bytes) => self.sandbox.write_file(path, bytes).await,
                        None => self.sandbox.delete_file(path).await,
                    }
                };
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ForgeError::AbortRequested),
                    result = write => result,
                };
                if let Err(err) = result {
                    mirrored = Err(err);
                    break 'sets;
                }
            }
        }

        if let Err(err) = mirrored {
            tracing::warn!(owners = ?owners, error = %err, "merge interrupted, restoring shared sandbox");
            self.restore(&base, &touched).await?;
            return Err(err);
        }

        let revision = self.arena.write().commit(staging, message)?;
        tracing::info!(%revision, owners = ?owners, paths = touched.len(), "merged into shared workspace");
        Ok(MergeReceipt {
            revision,
            paths: touched,
            owners,
        })
    }

    /// Make `target` the head again and resync the sandbox
    ///
    /// # Errors
    /// [`ForgeError::Arena`] for unknown revisions, [`ForgeError::Sandbox`]
    /// if the resync fails
    pub async fn rollback_to(&self, target: RevisionId) -> ForgeResult<RevisionId> {
        let _guard = self.merge_lock.lock().await;
        let before = self.snapshot();
        let revision = self.arena.write().rollback(target)?;
        let after = self.snapshot();

        let paths: BTreeSet<WorkspacePath> = before.paths().chain(after.paths()).cloned().collect();
        let changed: Vec<WorkspacePath> = paths
            .into_iter()
            .filter(|p| before.entry(p).map(|e| e.hash) != after.entry(p).map(|e| e.hash))
            .collect();
        self.restore(&after, &changed).await?;
        tracing::info!(%target, %revision, files = changed.len(), "rolled back shared workspace");
        Ok(revision)
    }

    async fn restore(&self, snapshot: &Snapshot, paths: &[WorkspacePath]) -> ForgeResult<()> {
        for path in paths {
            match snapshot.read(path) {
                Some(bytes) => self.sandbox.write_file(path, &bytes).await?,
                None => self.sandbox.delete_file(path).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VersionStore for SharedWorkspace {
    async fn commit(&self, changes: ChangeSet, message: &str) -> ForgeResult<RevisionId> {
        let receipt = self
            .merge(std::slice::from_ref(&changes), message, &CancellationToken::new())
            .await?;
        Ok(receipt.revision)
    }

    async fn rollback(&self, revision: RevisionId) -> ForgeResult<RevisionId> {
        self.rollback_to(revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MemorySandbox;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    fn workspace() -> (SharedWorkspace, Arc<MemorySandbox>) {
        let sandbox = Arc::new(MemorySandbox::new("shared"));
        let ws = SharedWorkspace::new(sandbox.clone());
        ws.register_claims("ui", [&p("ui/App.tsx")]).unwrap();
        ws.register_claims("api", [&p("api/server.ts")]).unwrap();
        (ws, sandbox)
    }

    fn set(owner: &str, path: &str, body: &str) -> ChangeSet {
        let mut set = ChangeSet::new(owner);
        set.write(p(path), body.as_bytes().to_vec());
        set
    }

    #[tokio::test]
    async fn merge_commits_and_mirrors() {
        let (ws, sandbox) = workspace();
        let receipt = ws
            .merge(&[set("ui", "ui/App.tsx", "app")], "ui", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(receipt.revision, ws.head());
        assert_eq!(ws.snapshot().owner_of(&p("ui/App.tsx")), Some("ui"));
        assert_eq!(sandbox.read_text(&p("ui/App.tsx")).as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn out_of_scope_write_conflicts_before_commit() {
        let (ws, sandbox) = workspace();
        let head = ws.head();
        let err = ws
            .merge(&[set("ui", "api/server.ts", "hijack")], "ui", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::FileConflict { .. }));
        assert_eq!(err.conflict_paths(), vec![p("api/server.ts")]);
        assert_eq!(ws.head(), head);
        assert!(sandbox.files().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_lock_writes_nothing() {
        let (ws, sandbox) = workspace();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ws.merge(&[set("ui", "ui/App.tsx", "app")], "ui", &cancel).await.unwrap_err();
        assert!(matches!(err, ForgeError::AbortRequested));
        assert!(sandbox.files().is_empty());
        assert_eq!(ws.history().len(), 1);
    }

    #[tokio::test]
    async fn rollback_resyncs_sandbox() {
        let (ws, sandbox) = workspace();
        let first = ws
            .merge(&[set("ui", "ui/App.tsx", "v1")], "v1", &CancellationToken::new())
            .await
            .unwrap()
            .revision;
        ws.merge(
            &[set("ui", "ui/App.tsx", "v2"), set("api", "api/server.ts", "srv")],
            "v2",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        VersionStore::rollback(&ws, first).await.unwrap();
        assert_eq!(sandbox.read_text(&p("ui/App.tsx")).as_deref(), Some("v1"));
        assert!(sandbox.read_text(&p("api/server.ts")).is_none());
        assert_eq!(ws.snapshot().read_text(&p("ui/App.tsx")).as_deref(), Some("v1"));
    }
}
