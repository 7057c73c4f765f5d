//! Components and their generation attempts

use crate::error::ForgeResult;
use crate::ports::GenerationMode;
use crate::types::{AgentId, AttemptId, ComponentId, CriterionId, SessionId};
use chrono::{DateTime, Utc};
use forge_artifact::{ContentHash, RevisionId, WorkspacePath};
use forge_kernel::ComponentStatus;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What a component promises to dependents and expects from dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceContract {
    /// Operations/types offered
    pub provides: Vec<String>,
    /// Operations/types used from dependencies
    pub consumes: Vec<String>,
}

/// Independently buildable unit of the target application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Id
    pub id: ComponentId,
    /// Owning session
    pub session_id: SessionId,
    /// Unique name, also the owner label in the merged workspace
    pub name: String,
    /// Components that must be merged first
    pub depends_on: Vec<ComponentId>,
    /// Lifecycle status
    pub status: ComponentStatus,
    /// Paths only this component may write
    pub owned_files: BTreeSet<WorkspacePath>,
    /// Declared interface
    pub interface: InterfaceContract,
    /// Criteria this component is responsible for
    pub criteria: Vec<CriterionId>,
    /// Feature the component belongs to, for feature rewrites
    pub feature: Option<String>,
    /// Paths rejected by the last merge
    pub flagged_paths: BTreeSet<WorkspacePath>,
    /// Successful merges so far
    pub build_count: u32,
    /// Revision of the last successful merge
    pub merged_revision: Option<RevisionId>,
}

impl Component {
    /// Move to `to`, enforcing the status table
    ///
    /// # Errors
    /// [`crate::ForgeError::InvalidTransition`] for edges outside the table
    pub fn transition(&mut self, to: ComponentStatus) -> ForgeResult<()> {
        self.status.validate_transition(to)?;
        tracing::debug!(component = %self.name, from = ?self.status, to = ?to, "component status");
        self.status = to;
        Ok(())
    }

    /// Move to `Building` unless already there
    ///
    /// # Errors
    /// Same as [`Component::transition`]
    pub fn begin_build(&mut self) -> ForgeResult<()> {
        if self.status == ComponentStatus::Building {
            return Ok(());
        }
        self.transition(ComponentStatus::Building)
    }

    /// True once the latest build made it into the shared workspace
    #[inline]
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.status == ComponentStatus::Merged
    }
}

/// All components of one session, shared by the coordinator and the driver
#[derive(Debug, Default)]
pub struct ComponentTable {
    components: RwLock<BTreeMap<ComponentId, Component>>,
}

impl ComponentTable {
    /// Table from a component list
    #[must_use]
    pub fn new(components: impl IntoIterator<Item = Component>) -> Self {
        Self {
            components: RwLock::new(components.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    /// Swap in a new partition; returns the previous components
    pub fn replace(&self, components: impl IntoIterator<Item = Component>) -> Vec<Component> {
        let fresh: BTreeMap<ComponentId, Component> = components.into_iter().map(|c| (c.id, c)).collect();
        std::mem::replace(&mut *self.components.write(), fresh)
            .into_values()
            .collect()
    }

    /// Copy of one component
    #[must_use]
    pub fn get(&self, id: ComponentId) -> Option<Component> {
        self.components.read().get(&id).cloned()
    }

    /// Copy of every component, ordered by id
    #[must_use]
    pub fn all(&self) -> Vec<Component> {
        self.components.read().values().cloned().collect()
    }

    /// Component by name
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Component> {
        self.components.read().values().find(|c| c.name == name).cloned()
    }

    /// Component owning `path`
    #[must_use]
    pub fn owner_of(&self, path: &WorkspacePath) -> Option<ComponentId> {
        self.components
            .read()
            .values()
            .find(|c| c.owned_files.contains(path))
            .map(|c| c.id)
    }

    /// All ids
    #[must_use]
    pub fn ids(&self) -> BTreeSet<ComponentId> {
        self.components.read().keys().copied().collect()
    }

    /// Mutate one component in place
    ///
    /// # Errors
    /// Whatever `f` returns; a missing id is [`crate::ForgeError::Config`]
    pub fn update<T>(
        &self,
        id: ComponentId,
        f: impl FnOnce(&mut Component) -> ForgeResult<T>,
    ) -> ForgeResult<T> {
        let mut guard = self.components.write();
        let component = guard
            .get_mut(&id)
            .ok_or_else(|| crate::ForgeError::Config(format!("unknown component {id}")))?;
        f(component)
    }

    /// Number of components
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    /// No components
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }
}

/// Outcome of one agent call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Output written to the candidate workspace
    Accepted,
    /// Output rejected (write conflict, out of scope)
    Rejected(String),
    /// Service error
    Failed(String),
    /// Service did not answer in time
    TimedOut,
    /// Candidate lost the tournament or was cancelled
    Discarded,
}

/// Audit record of one agent call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// Id
    pub id: AttemptId,
    /// Component built
    pub component_id: ComponentId,
    /// Calling agent
    pub agent_id: AgentId,
    /// Tournament candidate
    pub candidate: usize,
    /// Generation mode
    pub mode: GenerationMode,
    /// Short description of the prompt
    pub input_summary: String,
    /// Files produced, with hashes
    pub output_files: Vec<(WorkspacePath, ContentHash)>,
    /// Result
    pub status: AttemptStatus,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

/// Append-only attempt trail
#[derive(Debug, Default)]
pub struct AttemptLog {
    attempts: Mutex<Vec<GenerationAttempt>>,
}

impl AttemptLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one attempt
    pub fn record(&self, attempt: GenerationAttempt) {
        self.attempts.lock().push(attempt);
    }

    /// Mark every accepted attempt of a losing candidate as discarded
    ///
    /// Records are appended, never rewritten: a discard is a new record.
    pub fn discard_candidate(&self, component: ComponentId, candidate: usize, mode: GenerationMode) {
        let mut attempts = self.attempts.lock();
        let losers: Vec<GenerationAttempt> = attempts
            .iter()
            .filter(|a| {
                a.component_id == component
                    && a.candidate == candidate
                    && a.mode == mode
                    && a.status == AttemptStatus::Accepted
            })
            .map(|a| GenerationAttempt {
                id: AttemptId::new(),
                status: AttemptStatus::Discarded,
                finished_at: Utc::now(),
                ..a.clone()
            })
            .collect();
        attempts.extend(losers);
    }

    /// Every attempt, oldest first
    #[must_use]
    pub fn all(&self) -> Vec<GenerationAttempt> {
        self.attempts.lock().clone()
    }

    /// Attempts for one component
    #[must_use]
    pub fn for_component(&self, component: ComponentId) -> Vec<GenerationAttempt> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.component_id == component)
            .cloned()
            .collect()
    }

    /// Number of attempts
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Nothing recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str) -> Component {
        Component {
            id: ComponentId::new(),
            session_id: SessionId::new(),
            name: name.into(),
            depends_on: Vec::new(),
            status: ComponentStatus::Pending,
            owned_files: [WorkspacePath::new(format!("src/{name}.ts")).unwrap()].into(),
            interface: InterfaceContract::default(),
            criteria: Vec::new(),
            feature: None,
            flagged_paths: BTreeSet::new(),
            build_count: 0,
            merged_revision: None,
        }
    }

    #[test]
    fn status_table_is_enforced() {
        let mut c = component("ui");
        assert!(c.transition(ComponentStatus::Merged).is_err());
        c.begin_build().unwrap();
        c.begin_build().unwrap();
        c.transition(ComponentStatus::Verifying).unwrap();
        c.transition(ComponentStatus::Merged).unwrap();
        assert!(c.is_merged());
        c.begin_build().unwrap();
        assert_eq!(c.status, ComponentStatus::Building);
    }

    #[test]
    fn table_lookups() {
        let ui = component("ui");
        let api = component("api");
        let ui_id = ui.id;
        let table = ComponentTable::new([ui, api]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.by_name("ui").unwrap().id, ui_id);
        assert_eq!(
            table.owner_of(&WorkspacePath::new("src/ui.ts").unwrap()),
            Some(ui_id)
        );
        table
            .update(ui_id, |c| {
                c.build_count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(table.get(ui_id).unwrap().build_count, 1);
        assert!(table.update(ComponentId::new(), |_| Ok(())).is_err());
    }

    #[test]
    fn discards_are_appended() {
        let log = AttemptLog::new();
        let component = ComponentId::new();
        let now = Utc::now();
        log.record(GenerationAttempt {
            id: AttemptId::new(),
            component_id: component,
            agent_id: AgentId::new(),
            candidate: 1,
            mode: GenerationMode::Build,
            input_summary: "build ui".into(),
            output_files: Vec::new(),
            status: AttemptStatus::Accepted,
            started_at: now,
            finished_at: now,
        });
        log.discard_candidate(component, 1, GenerationMode::Build);
        let all = log.for_component(component);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, AttemptStatus::Accepted);
        assert_eq!(all[1].status, AttemptStatus::Discarded);
    }
}
