//! Intent Contract Engine
//!
//! Turns a natural-language request into an [`IntentContract`]: an ordered
//! list of success criteria, each carrying a machine-checkable
//! [`VerificationMethod`]. Contracts are locked on creation. Once locked a
//! contract is never edited; amendments produce a new contract that points
//! back at the one it supersedes.

use crate::error::{ForgeError, ForgeResult};
use crate::ports::ContractDrafter;
use crate::types::{ContractId, CriterionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use forge_artifact::{ContentHash, WorkspacePath};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How a criterion is checked against the merged workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationMethod {
    /// File must exist
    FileExists {
        /// Target file
        path: WorkspacePath,
    },
    /// File must exist and contain literal text
    FileContains {
        /// Target file
        path: WorkspacePath,
        /// Required text
        text: String,
    },
    /// No file (under `under`, if given) may contain literal text
    Absent {
        /// Forbidden text
        text: String,
        /// Directory prefix
        under: Option<String>,
    },
    /// Command must exit zero in the merged sandbox
    CommandSucceeds {
        /// Shell command
        command: String,
        /// Substring stdout must contain
        expect_stdout: Option<String>,
    },
}

impl VerificationMethod {
    /// Stable reference string, e.g. `file_contains:src/app.ts`
    #[must_use]
    pub fn reference(&self) -> String {
        match self {
            Self::FileExists { path } => format!("file_exists:{path}"),
            Self::FileContains { path, text } => format!("file_contains:{path}:{text}"),
            Self::Absent { text, under } => {
                format!("absent:{}:{text}", under.as_deref().unwrap_or("*"))
            }
            Self::CommandSucceeds { command, .. } => format!("command:{command}"),
        }
    }

    /// File the method targets, if it names one
    #[must_use]
    pub fn target_path(&self) -> Option<&WorkspacePath> {
        match self {
            Self::FileExists { path } | Self::FileContains { path, .. } => Some(path),
            Self::Absent { .. } | Self::CommandSucceeds { .. } => None,
        }
    }
}

/// One success criterion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// `C1`, `C2`, ...
    pub id: CriterionId,
    /// Human description
    pub description: String,
    /// Machine check
    pub method: VerificationMethod,
}

/// A user journey the app must support
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserWorkflow {
    /// Workflow name
    pub name: String,
    /// Ordered steps
    pub steps: Vec<String>,
}

/// Visual and behavioral identity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentitySpec {
    /// Product name
    pub name: Option<String>,
    /// Allowed colors, as `#rrggbb`
    pub palette: Vec<String>,
    /// Allowed font families
    pub fonts: Vec<String>,
    /// Voice/tone notes
    pub tone: Option<String>,
}

/// Caller input to [`ContractEngine::create_contract`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRequest {
    /// Natural-language request
    pub request: String,
    /// Identity supplied up front, merged with whatever the drafter finds
    pub identity: Option<IdentitySpec>,
}

impl ContractRequest {
    /// Request from text
    #[must_use]
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            identity: None,
        }
    }

    /// With identity
    #[inline]
    #[must_use]
    pub fn with_identity(mut self, identity: IdentitySpec) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// A criterion before ids are assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionDraft {
    /// Human description
    pub description: String,
    /// Machine check; `None` means the drafter could not derive one
    pub method: Option<VerificationMethod>,
}

/// Drafter output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDraft {
    /// Proposed criteria, in order
    pub criteria: Vec<CriterionDraft>,
    /// User workflows
    pub workflows: Vec<UserWorkflow>,
    /// Identity
    pub identity: IdentitySpec,
    /// Ambiguity in `[0, 1]`
    pub ambiguity: f64,
    /// Questions to put back to the caller
    pub open_questions: Vec<String>,
}

/// Immutable success-criteria document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentContract {
    id: ContractId,
    source_request: String,
    criteria: Vec<SuccessCriterion>,
    workflows: Vec<UserWorkflow>,
    identity: IdentitySpec,
    locked: bool,
    supersedes: Option<ContractId>,
    amendment_note: Option<String>,
    created_at: DateTime<Utc>,
    /// Highest criterion number ever issued along the amendment chain
    #[serde(default)]
    issued_criteria: usize,
}

impl IntentContract {
    /// Unlocked contract with no criteria
    #[must_use]
    pub fn draft(source_request: impl Into<String>) -> Self {
        Self {
            id: ContractId::new(),
            source_request: source_request.into(),
            criteria: Vec::new(),
            workflows: Vec::new(),
            identity: IdentitySpec::default(),
            locked: false,
            supersedes: None,
            amendment_note: None,
            created_at: Utc::now(),
            issued_criteria: 0,
        }
    }

    /// Contract id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ContractId {
        self.id
    }

    /// Original request text
    #[inline]
    #[must_use]
    pub fn source_request(&self) -> &str {
        &self.source_request
    }

    /// Ordered criteria
    #[inline]
    #[must_use]
    pub fn criteria(&self) -> &[SuccessCriterion] {
        &self.criteria
    }

    /// Criterion by id
    #[must_use]
    pub fn criterion(&self, id: &CriterionId) -> Option<&SuccessCriterion> {
        self.criteria.iter().find(|c| &c.id == id)
    }

    /// User workflows
    #[inline]
    #[must_use]
    pub fn workflows(&self) -> &[UserWorkflow] {
        &self.workflows
    }

    /// Identity spec
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &IdentitySpec {
        &self.identity
    }

    /// Locked contracts never change
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Contract this one replaces
    #[inline]
    #[must_use]
    pub fn supersedes(&self) -> Option<ContractId> {
        self.supersedes
    }

    /// Why this contract was amended
    #[must_use]
    pub fn amendment_note(&self) -> Option<&str> {
        self.amendment_note.as_deref()
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Digest of everything a lock freezes
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        let body = serde_json::to_vec(&(&self.criteria, &self.workflows, &self.identity))
            .unwrap_or_default();
        ContentHash::compute_parts([self.id.to_string().as_bytes(), body.as_slice()])
    }

    /// Append a criterion
    ///
    /// # Errors
    /// [`ForgeError::ContractLocked`] once locked
    pub fn add_criterion(&mut self, draft: CriterionDraft) -> ForgeResult<CriterionId> {
        self.ensure_unlocked()?;
        let method = draft.method.ok_or_else(|| ForgeError::ContractGeneration {
            reason: format!("criterion '{}' has no verification method", draft.description),
            ambiguity: 1.0,
            questions: vec![format!("How should '{}' be verified?", draft.description)],
        })?;
        let number = self.last_criterion_number() + 1;
        self.issued_criteria = number;
        let id = CriterionId(format!("C{number}"));
        self.criteria.push(SuccessCriterion {
            id: id.clone(),
            description: draft.description,
            method,
        });
        Ok(id)
    }

    /// Remove a criterion
    ///
    /// # Errors
    /// [`ForgeError::ContractLocked`] once locked
    pub fn remove_criterion(&mut self, id: &CriterionId) -> ForgeResult<bool> {
        self.ensure_unlocked()?;
        let before = self.criteria.len();
        self.criteria.retain(|c| &c.id != id);
        Ok(self.criteria.len() != before)
    }

    /// Replace the identity spec
    ///
    /// # Errors
    /// [`ForgeError::ContractLocked`] once locked
    pub fn set_identity(&mut self, identity: IdentitySpec) -> ForgeResult<()> {
        self.ensure_unlocked()?;
        self.identity = identity;
        Ok(())
    }

    /// Add a workflow
    ///
    /// # Errors
    /// [`ForgeError::ContractLocked`] once locked
    pub fn add_workflow(&mut self, workflow: UserWorkflow) -> ForgeResult<()> {
        self.ensure_unlocked()?;
        self.workflows.push(workflow);
        Ok(())
    }

    /// One-way lock
    ///
    /// # Errors
    /// [`ForgeError::ContractGeneration`] if there is nothing to lock
    pub fn lock(&mut self) -> ForgeResult<()> {
        if self.criteria.is_empty() {
            return Err(ForgeError::ContractGeneration {
                reason: "contract has no success criteria".into(),
                ambiguity: 1.0,
                questions: vec!["What must the finished application do?".into()],
            });
        }
        self.locked = true;
        Ok(())
    }

    /// New locked contract chained to this one
    ///
    /// Kept criteria keep their ids; added criteria continue the numbering.
    ///
    /// # Errors
    /// [`ForgeError::ContractGeneration`] if this contract is still a draft
    /// or an added criterion has no verification method
    pub fn amend(&self, amendment: ContractAmendment) -> ForgeResult<IntentContract> {
        if !self.locked {
            return Err(ForgeError::ContractGeneration {
                reason: "only locked contracts are amended; edit the draft instead".into(),
                ambiguity: 0.0,
                questions: Vec::new(),
            });
        }
        let mut next = Self {
            id: ContractId::new(),
            source_request: self.source_request.clone(),
            criteria: self
                .criteria
                .iter()
                .filter(|c| !amendment.remove.contains(&c.id))
                .cloned()
                .collect(),
            workflows: self.workflows.clone(),
            identity: amendment.identity.unwrap_or_else(|| self.identity.clone()),
            locked: false,
            supersedes: Some(self.id),
            amendment_note: Some(amendment.note),
            created_at: Utc::now(),
            issued_criteria: 0,
        };
        // Numbering continues after the highest id ever used in the chain
        let mut counter = self.last_criterion_number();
        for draft in amendment.add {
            let method = draft.method.ok_or_else(|| ForgeError::ContractGeneration {
                reason: format!("criterion '{}' has no verification method", draft.description),
                ambiguity: 1.0,
                questions: vec![format!("How should '{}' be verified?", draft.description)],
            })?;
            counter += 1;
            next.criteria.push(SuccessCriterion {
                id: CriterionId(format!("C{counter}")),
                description: draft.description,
                method,
            });
        }
        next.issued_criteria = counter;
        next.lock()?;
        Ok(next)
    }

    fn ensure_unlocked(&self) -> ForgeResult<()> {
        if self.locked {
            Err(ForgeError::ContractLocked(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Contracts stored before the counter existed fall back to their ids
    fn last_criterion_number(&self) -> usize {
        self.criteria
            .iter()
            .filter_map(|c| c.id.as_str().strip_prefix('C')?.parse::<usize>().ok())
            .max()
            .unwrap_or(0)
            .max(self.issued_criteria)
    }
}

impl fmt::Display for IntentContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "contract {} ({} criteria)", self.id, self.criteria.len())?;
        for c in &self.criteria {
            writeln!(f, "  {} {} [{}]", c.id, c.description, c.method.reference())?;
        }
        Ok(())
    }
}

/// Scope change for a locked contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAmendment {
    /// New criteria
    pub add: Vec<CriterionDraft>,
    /// Criteria to drop
    pub remove: Vec<CriterionId>,
    /// Replacement identity
    pub identity: Option<IdentitySpec>,
    /// Reason, kept for audit
    pub note: String,
}

/// Creates locked contracts from requests
pub struct ContractEngine {
    drafter: Arc<dyn ContractDrafter>,
    ambiguity_threshold: f64,
}

impl fmt::Debug for ContractEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractEngine")
            .field("ambiguity_threshold", &self.ambiguity_threshold)
            .finish_non_exhaustive()
    }
}

impl ContractEngine {
    /// Engine over a drafter
    #[must_use]
    pub fn new(drafter: Arc<dyn ContractDrafter>, ambiguity_threshold: f64) -> Self {
        Self {
            drafter,
            ambiguity_threshold,
        }
    }

    /// Draft, validate and lock a contract
    ///
    /// # Errors
    /// [`ForgeError::ContractGeneration`] when the draft is too ambiguous,
    /// empty, or has a criterion without a verification method
    pub async fn create_contract(&self, request: &ContractRequest) -> ForgeResult<IntentContract> {
        let draft = self.drafter.draft(request).await?;

        if draft.ambiguity > self.ambiguity_threshold {
            tracing::warn!(
                ambiguity = draft.ambiguity,
                threshold = self.ambiguity_threshold,
                "request too ambiguous"
            );
            return Err(ForgeError::ContractGeneration {
                reason: format!(
                    "ambiguity {:.2} exceeds threshold {:.2}",
                    draft.ambiguity, self.ambiguity_threshold
                ),
                ambiguity: draft.ambiguity,
                questions: draft.open_questions,
            });
        }

        let mut contract = IntentContract::draft(request.request.clone());
        let mut identity = draft.identity;
        if let Some(given) = &request.identity {
            merge_identity(&mut identity, given);
        }
        contract.set_identity(identity)?;
        for workflow in draft.workflows {
            contract.add_workflow(workflow)?;
        }
        for criterion in draft.criteria {
            contract.add_criterion(criterion)?;
        }
        contract.lock()?;

        tracing::info!(
            contract_id = %contract.id(),
            criteria = contract.criteria().len(),
            "contract locked"
        );
        Ok(contract)
    }
}

fn merge_identity(into: &mut IdentitySpec, given: &IdentitySpec) {
    if given.name.is_some() {
        into.name.clone_from(&given.name);
    }
    if given.tone.is_some() {
        into.tone.clone_from(&given.tone);
    }
    for color in &given.palette {
        if !into.palette.contains(color) {
            into.palette.push(color.clone());
        }
    }
    for font in &given.fonts {
        if !into.fonts.contains(font) {
            into.fonts.push(font.clone());
        }
    }
}

/// Store of every contract ever locked, keyed by id
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: DashMap<ContractId, Arc<IntentContract>>,
}

impl ContractRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locked contract
    ///
    /// # Errors
    /// [`ForgeError::ContractLocked`] if the contract is unlocked or its id is
    /// already registered (registered contracts are never replaced)
    pub fn insert(&self, contract: IntentContract) -> ForgeResult<Arc<IntentContract>> {
        if !contract.is_locked() {
            return Err(ForgeError::ContractGeneration {
                reason: "only locked contracts are registered".into(),
                ambiguity: 0.0,
                questions: Vec::new(),
            });
        }
        let id = contract.id();
        let contract = Arc::new(contract);
        match self.contracts.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ForgeError::ContractLocked(id.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&contract));
                Ok(contract)
            }
        }
    }

    /// Contract by id
    #[must_use]
    pub fn get(&self, id: ContractId) -> Option<Arc<IntentContract>> {
        self.contracts.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// `id` followed by every contract it supersedes, newest first
    #[must_use]
    pub fn lineage(&self, id: ContractId) -> Vec<Arc<IntentContract>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(contract) = self.get(current) else {
                break;
            };
            cursor = contract.supersedes();
            chain.push(contract);
            if chain.len() > self.contracts.len() {
                break;
            }
        }
        chain
    }

    /// Number of registered contracts
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// No contracts
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

static BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(?P<body>.+?)\s*$").expect("static regex"));
static FILE_EXISTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^file\s+`?(?P<path>[\w./-]+)`?\s+exists$").expect("static regex")
});
static FILE_CONTAINS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^file\s+`?(?P<path>[\w./-]+)`?\s+contains\s+["`]?(?P<text>.+?)["`]?$"#)
        .expect("static regex")
});
static COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^command\s+`(?P<cmd>[^`]+)`\s+succeeds(?:\s+printing\s+`(?P<out>[^`]+)`)?$")
        .expect("static regex")
});
static ABSENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^no\s+["`]?(?P<text>.+?)["`]?\s+(?:anywhere|in\s+`?(?P<dir>[\w./-]+)`?)$"#)
        .expect("static regex")
});
static WORKFLOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^workflow\s+(?P<name>[\w -]+?)\s*:\s*(?P<steps>.+)$").expect("static regex")
});
static PALETTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#[0-9a-fA-F]{6}\b").expect("static regex"));

/// Rule-based drafter for structured requests
///
/// Bullet lines become criteria when they match one of:
/// - ``file `path` exists``
/// - ``file `path` contains "text"``
/// - ``command `cmd` succeeds`` (optionally ``printing `out` ``)
/// - ``no "text" anywhere`` / ``no "text" in `dir` ``
///
/// Lines starting `workflow name: a -> b` become workflows; `palette:` and
/// `fonts:` lines feed the identity. Unrecognized bullets raise ambiguity.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDrafter;

impl HeuristicDrafter {
    /// Draft synchronously
    #[must_use]
    pub fn draft_text(text: &str) -> ContractDraft {
        let mut draft = ContractDraft::default();
        let mut bullets = 0usize;
        let mut unparsed = 0usize;

        for line in text.lines() {
            let trimmed = line.trim();
            let lower = trimmed.to_ascii_lowercase();
            if lower.starts_with("palette:") {
                draft.identity.palette.extend(
                    PALETTE.find_iter(trimmed).map(|m| m.as_str().to_ascii_lowercase()),
                );
                continue;
            }
            if let Some(rest) = lower.strip_prefix("fonts:").map(|_| &trimmed["fonts:".len()..]) {
                draft
                    .identity
                    .fonts
                    .extend(rest.split(',').map(str::trim).filter(|f| !f.is_empty()).map(String::from));
                continue;
            }
            if let Some(caps) = WORKFLOW.captures(trimmed) {
                draft.workflows.push(UserWorkflow {
                    name: caps["name"].trim().to_string(),
                    steps: caps["steps"].split("->").map(|s| s.trim().to_string()).collect(),
                });
                continue;
            }
            let Some(caps) = BULLET.captures(line) else {
                continue;
            };
            bullets += 1;
            let body = caps["body"].to_string();
            let method = parse_method(&body);
            if method.is_none() {
                unparsed += 1;
                draft
                    .open_questions
                    .push(format!("How should '{body}' be verified?"));
            }
            draft.criteria.push(CriterionDraft {
                description: body,
                method,
            });
        }

        if bullets == 0 {
            draft.ambiguity = 1.0;
            draft
                .open_questions
                .push("List the success criteria as bullet points.".into());
        } else {
            draft.ambiguity = unparsed as f64 / bullets as f64;
        }
        draft
    }
}

#[async_trait]
impl ContractDrafter for HeuristicDrafter {
    async fn draft(&self, request: &ContractRequest) -> ForgeResult<ContractDraft> {
        Ok(Self::draft_text(&request.request))
    }
}

fn parse_method(body: &str) -> Option<VerificationMethod> {
    if let Some(caps) = FILE_EXISTS.captures(body) {
        return WorkspacePath::new(&caps["path"])
            .ok()
            .map(|path| VerificationMethod::FileExists { path });
    }
    if let Some(caps) = FILE_CONTAINS.captures(body) {
        return WorkspacePath::new(&caps["path"])
            .ok()
            .map(|path| VerificationMethod::FileContains {
                path,
                text: caps["text"].to_string(),
            });
    }
    if let Some(caps) = COMMAND.captures(body) {
        return Some(VerificationMethod::CommandSucceeds {
            command: caps["cmd"].to_string(),
            expect_stdout: caps.name("out").map(|m| m.as_str().to_string()),
        });
    }
    if let Some(caps) = ABSENT.captures(body) {
        return Some(VerificationMethod::Absent {
            text: caps["text"].to_string(),
            under: caps.name("dir").map(|m| m.as_str().to_string()),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn method(path: &str) -> Option<VerificationMethod> {
        Some(VerificationMethod::FileExists {
            path: WorkspacePath::new(path).unwrap(),
        })
    }

    fn locked() -> IntentContract {
        let mut c = IntentContract::draft("todo app");
        c.add_criterion(CriterionDraft {
            description: "has app".into(),
            method: method("src/app.ts"),
        })
        .unwrap();
        c.add_criterion(CriterionDraft {
            description: "has api".into(),
            method: method("src/api.ts"),
        })
        .unwrap();
        c.lock().unwrap();
        c
    }

    #[test]
    fn heuristic_drafter_parses_methods() {
        let draft = HeuristicDrafter::draft_text(
            "Build a todo app.\n\
             - file `src/App.tsx` exists\n\
             - file src/api/todos.ts contains \"export async function listTodos\"\n\
             - command `npm test` succeeds printing `passed`\n\
             - no \"TODO\" in src\n\
             workflow add todo: open app -> type title -> press enter\n\
             palette: #112233, #AABBCC\n\
             fonts: Inter, Fira Code\n",
        );
        assert_eq!(draft.criteria.len(), 4);
        assert!(draft.criteria.iter().all(|c| c.method.is_some()));
        assert_eq!(draft.ambiguity, 0.0);
        assert_eq!(draft.workflows[0].steps.len(), 3);
        assert_eq!(draft.identity.palette, vec!["#112233", "#aabbcc"]);
        assert_eq!(draft.identity.fonts, vec!["Inter", "Fira Code"]);
        assert!(matches!(
            draft.criteria[2].method,
            Some(VerificationMethod::CommandSucceeds { ref expect_stdout, .. }) if expect_stdout.as_deref() == Some("passed")
        ));
    }

    #[tokio::test]
    async fn ambiguous_request_is_rejected() {
        let engine = ContractEngine::new(Arc::new(HeuristicDrafter), 0.3);
        let err = engine
            .create_contract(&ContractRequest::new("make me something nice"))
            .await
            .unwrap_err();
        let ForgeError::ContractGeneration { questions, .. } = err else {
            panic!("expected contract generation error");
        };
        assert!(!questions.is_empty());

        let half = "- file `a.ts` exists\n- make it pop\n";
        assert!(engine.create_contract(&ContractRequest::new(half)).await.is_err());
    }

    #[tokio::test]
    async fn created_contract_is_locked_and_numbered() {
        let engine = ContractEngine::new(Arc::new(HeuristicDrafter), 0.3);
        let contract = engine
            .create_contract(&ContractRequest::new("- file `a.ts` exists\n- file `b.ts` exists"))
            .await
            .unwrap();
        assert!(contract.is_locked());
        let ids: Vec<_> = contract.criteria().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C2"]);
    }

    #[test]
    fn locked_contract_rejects_mutation() {
        let mut c = locked();
        let before = c.content_hash();
        assert!(matches!(
            c.add_criterion(CriterionDraft {
                description: "x".into(),
                method: method("x.ts")
            }),
            Err(ForgeError::ContractLocked(_))
        ));
        assert!(c.remove_criterion(&CriterionId::from("C1")).is_err());
        assert!(c.set_identity(IdentitySpec::default()).is_err());
        assert_eq!(c.content_hash(), before);
    }

    #[test]
    fn amendment_creates_chained_contract() {
        let original = locked();
        let amended = original
            .amend(ContractAmendment {
                add: vec![CriterionDraft {
                    description: "has db".into(),
                    method: method("src/db.ts"),
                }],
                remove: vec![CriterionId::from("C1")],
                identity: None,
                note: "drop app, add db".into(),
            })
            .unwrap();

        assert_ne!(amended.id(), original.id());
        assert_eq!(amended.supersedes(), Some(original.id()));
        assert!(amended.is_locked());
        let ids: Vec<_> = amended.criteria().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C2", "C3"]);
        assert_eq!(original.criteria().len(), 2);
    }

    #[test]
    fn removed_ids_are_never_reissued() {
        let original = locked();
        let dropped = original
            .amend(ContractAmendment {
                remove: vec![CriterionId::from("C2")],
                note: "drop C2".into(),
                ..Default::default()
            })
            .unwrap();
        let readded = dropped
            .amend(ContractAmendment {
                add: vec![CriterionDraft {
                    description: "has db".into(),
                    method: method("src/db.ts"),
                }],
                note: "add db".into(),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<_> = readded.criteria().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "C3"]);
    }

    #[test]
    fn registry_tracks_lineage_and_never_replaces() {
        let registry = ContractRegistry::new();
        let original = locked();
        let amended = original
            .amend(ContractAmendment {
                note: "no-op".into(),
                ..Default::default()
            })
            .unwrap();
        let original_id = original.id();
        let amended_id = amended.id();
        registry.insert(original.clone()).unwrap();
        registry.insert(amended).unwrap();

        let chain: Vec<_> = registry.lineage(amended_id).iter().map(|c| c.id()).collect();
        assert_eq!(chain, vec![amended_id, original_id]);
        assert!(matches!(registry.insert(original), Err(ForgeError::ContractLocked(_))));
        assert!(registry.insert(IntentContract::draft("unlocked")).is_err());
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Add(String),
        Remove(usize),
        Identity(String),
    }

    fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(Edit::Add),
            (0usize..5).prop_map(Edit::Remove),
            "[a-z]{1,8}".prop_map(Edit::Identity),
        ]
    }

    proptest! {
        #[test]
        fn no_edit_changes_a_locked_contract(edits in proptest::collection::vec(edit(), 0..20)) {
            let mut contract = locked();
            let frozen = contract.clone();
            for e in edits {
                let result = match e {
                    Edit::Add(d) => contract.add_criterion(CriterionDraft { description: d, method: method("p.ts") }).map(|_| ()),
                    Edit::Remove(i) => contract.remove_criterion(&CriterionId::nth(i)).map(|_| ()),
                    Edit::Identity(name) => contract.set_identity(IdentitySpec { name: Some(name), ..Default::default() }),
                };
                prop_assert!(result.is_err());
            }
            prop_assert_eq!(contract, frozen);
        }
    }
}
