//! Intent satisfaction gate
//!
//! Evaluates every contract criterion against the merged workspace and
//! traces each unsatisfied one to the smallest set of components that can
//! close it. Evaluation only reads: the same snapshot and sandbox give the
//! same partition every time.

use crate::component::Component;
use crate::contract::{IntentContract, SuccessCriterion, VerificationMethod};
use crate::ports::WorkspaceSandbox;
use crate::types::{ComponentId, CriterionId};
use forge_artifact::{RevisionId, Snapshot, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One unsatisfied criterion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Criterion
    pub criterion: CriterionId,
    /// Why it failed
    pub detail: String,
    /// Files that must change, when the method names them
    pub paths: BTreeSet<WorkspacePath>,
    /// Components that must be rebuilt
    pub responsible: BTreeSet<ComponentId>,
}

/// Satisfied/unsatisfied partition of the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    /// Revision evaluated
    pub revision: RevisionId,
    /// Criteria met, contract order
    pub satisfied: Vec<CriterionId>,
    /// Criteria not met, contract order
    pub unsatisfied: Vec<Gap>,
}

impl GateReport {
    /// Every criterion met
    #[inline]
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.unsatisfied.is_empty()
    }

    /// Ids of the unsatisfied criteria
    #[must_use]
    pub fn unsatisfied_ids(&self) -> Vec<CriterionId> {
        self.unsatisfied.iter().map(|g| g.criterion.clone()).collect()
    }

    /// Union of the responsible components
    #[must_use]
    pub fn responsible(&self) -> BTreeSet<ComponentId> {
        self.unsatisfied.iter().flat_map(|g| g.responsible.iter().copied()).collect()
    }
}

/// Criterion evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct SatisfactionGate;

impl SatisfactionGate {
    /// Evaluate every criterion of `contract`
    ///
    /// A command that cannot run leaves its criterion unsatisfied.
    pub async fn evaluate(
        &self,
        contract: &IntentContract,
        snapshot: &Snapshot,
        sandbox: &Arc<dyn WorkspaceSandbox>,
        components: &[Component],
    ) -> GateReport {
        let mut satisfied = Vec::new();
        let mut unsatisfied = Vec::new();
        for criterion in contract.criteria() {
            match check(&criterion.method, snapshot, sandbox).await {
                Verdict::Met => satisfied.push(criterion.id.clone()),
                Verdict::Unmet { detail, paths } => {
                    let responsible = responsible_for(criterion, &paths, components);
                    tracing::debug!(
                        criterion = %criterion.id,
                        %detail,
                        responsible = responsible.len(),
                        "criterion unsatisfied"
                    );
                    unsatisfied.push(Gap {
                        criterion: criterion.id.clone(),
                        detail,
                        paths,
                        responsible,
                    });
                }
            }
        }
        tracing::info!(
            revision = %snapshot.revision(),
            satisfied = satisfied.len(),
            unsatisfied = unsatisfied.len(),
            "satisfaction gate evaluated"
        );
        GateReport {
            revision: snapshot.revision(),
            satisfied,
            unsatisfied,
        }
    }
}

enum Verdict {
    Met,
    Unmet {
        detail: String,
        paths: BTreeSet<WorkspacePath>,
    },
}

fn unmet(detail: impl Into<String>, paths: impl IntoIterator<Item = WorkspacePath>) -> Verdict {
    Verdict::Unmet {
        detail: detail.into(),
        paths: paths.into_iter().collect(),
    }
}

async fn check(method: &VerificationMethod, snapshot: &Snapshot, sandbox: &Arc<dyn WorkspaceSandbox>) -> Verdict {
    match method {
        VerificationMethod::FileExists { path } => {
            if snapshot.contains(path) {
                Verdict::Met
            } else {
                unmet(format!("{path} does not exist"), [path.clone()])
            }
        }
        VerificationMethod::FileContains { path, text } => match snapshot.read_text(path) {
            Some(content) if content.contains(text.as_str()) => Verdict::Met,
            Some(_) => unmet(format!("{path} does not contain `{text}`"), [path.clone()]),
            None => unmet(format!("{path} does not exist"), [path.clone()]),
        },
        VerificationMethod::Absent { text, under } => {
            let offenders: Vec<WorkspacePath> = snapshot
                .paths()
                .filter(|p| under.as_deref().map_or(true, |dir| p.is_under(dir)))
                .filter(|p| snapshot.read_text(p).is_some_and(|c| c.contains(text.as_str())))
                .cloned()
                .collect();
            if offenders.is_empty() {
                Verdict::Met
            } else {
                let listed: Vec<&str> = offenders.iter().map(WorkspacePath::as_str).collect();
                unmet(format!("`{text}` found in {}", listed.join(", ")), offenders)
            }
        }
        VerificationMethod::CommandSucceeds { command, expect_stdout } => match sandbox.exec(command).await {
            Err(err) => unmet(format!("`{command}` could not run: {err}"), []),
            Ok(output) if !output.success() => unmet(
                format!("`{command}` exited with {}: {}", output.exit_code, output.stderr.trim()),
                mentioned_paths(snapshot, &output.stderr),
            ),
            Ok(output) => match expect_stdout {
                Some(expected) if !output.stdout.contains(expected.as_str()) => {
                    unmet(format!("`{command}` output lacks `{expected}`"), [])
                }
                _ => Verdict::Met,
            },
        },
    }
}

/// Snapshot paths mentioned in command output
pub(crate) fn mentioned_paths(snapshot: &Snapshot, output: &str) -> Vec<WorkspacePath> {
    snapshot
        .paths()
        .filter(|p| output.contains(p.as_str()))
        .cloned()
        .collect()
}

/// Owners of the implicated paths, else the components that declared the
/// criterion, else everyone
fn responsible_for(
    criterion: &SuccessCriterion,
    paths: &BTreeSet<WorkspacePath>,
    components: &[Component],
) -> BTreeSet<ComponentId> {
    let by_path: BTreeSet<ComponentId> = components
        .iter()
        .filter(|c| paths.iter().any(|p| c.owned_files.contains(p)))
        .map(|c| c.id)
        .collect();
    if !by_path.is_empty() {
        return by_path;
    }
    let declared: BTreeSet<ComponentId> = components
        .iter()
        .filter(|c| c.criteria.contains(&criterion.id))
        .map(|c| c.id)
        .collect();
    if !declared.is_empty() {
        return declared;
    }
    components.iter().map(|c| c.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::InterfaceContract;
    use crate::contract::CriterionDraft;
    use crate::ports::ExecOutput;
    use crate::sandbox::MemorySandbox;
    use crate::types::SessionId;
    use forge_artifact::{ChangeSet, SnapshotArena};
    use forge_kernel::ComponentStatus;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::new(s).unwrap()
    }

    fn component(name: &str, files: &[&str], criteria: &[&str]) -> Component {
        Component {
            id: ComponentId::new(),
            session_id: SessionId::new(),
            name: name.into(),
            depends_on: Vec::new(),
            status: ComponentStatus::Merged,
            owned_files: files.iter().map(|f| p(f)).collect(),
            interface: InterfaceContract::default(),
            criteria: criteria.iter().map(|c| CriterionId::from(*c)).collect(),
            feature: None,
            flagged_paths: BTreeSet::new(),
            build_count: 1,
            merged_revision: None,
        }
    }

    fn contract(methods: Vec<VerificationMethod>) -> IntentContract {
        let mut contract = IntentContract::draft("todo app");
        for (i, method) in methods.into_iter().enumerate() {
            contract
                .add_criterion(CriterionDraft {
                    description: format!("criterion {i}"),
                    method: Some(method),
                })
                .unwrap();
        }
        contract.lock().unwrap();
        contract
    }

    fn snapshot(files: &[(&str, &str)]) -> Snapshot {
        let mut set = ChangeSet::new("ui");
        for (path, body) in files {
            set.write(p(path), body.as_bytes().to_vec());
        }
        SnapshotArena::new().head().overlay(&set)
    }

    fn sandbox() -> Arc<dyn WorkspaceSandbox> {
        Arc::new(MemorySandbox::new("shared").with_handler(Arc::new(
            |cmd: &str, _files: &BTreeMap<WorkspacePath, Vec<u8>>| match cmd {
                "npm test" => Some(ExecOutput {
                    stdout: "3 passing".into(),
                    ..ExecOutput::default()
                }),
                "npm run e2e" => Some(ExecOutput {
                    stderr: "failed in src/api/server.ts".into(),
                    exit_code: 1,
                    ..ExecOutput::default()
                }),
                _ => None,
            },
        )))
    }

    #[tokio::test]
    async fn partitions_and_traces_gaps() {
        let ui = component("ui", &["src/ui/App.tsx"], &[]);
        let api = component("api", &["src/api/server.ts"], &["C5"]);
        let contract = contract(vec![
            VerificationMethod::FileExists { path: p("src/ui/App.tsx") },
            VerificationMethod::FileContains {
                path: p("src/api/server.ts"),
                text: "listen(".into(),
            },
            VerificationMethod::Absent {
                text: "lorem".into(),
                under: Some("src".into()),
            },
            VerificationMethod::CommandSucceeds {
                command: "npm test".into(),
                expect_stdout: Some("passing".into()),
            },
            VerificationMethod::CommandSucceeds {
                command: "npm run e2e".into(),
                expect_stdout: None,
            },
        ]);
        let snap = snapshot(&[
            ("src/ui/App.tsx", "export const App = () => 'lorem';\n"),
            ("src/api/server.ts", "export const app = {};\n"),
        ]);
        let components = vec![ui.clone(), api.clone()];

        let report = SatisfactionGate.evaluate(&contract, &snap, &sandbox(), &components).await;
        assert_eq!(report.satisfied, vec![CriterionId::from("C1"), CriterionId::from("C4")]);
        assert_eq!(
            report.unsatisfied_ids(),
            vec![CriterionId::from("C2"), CriterionId::from("C3"), CriterionId::from("C5")]
        );
        assert_eq!(report.unsatisfied[0].responsible, BTreeSet::from([api.id]));
        assert_eq!(report.unsatisfied[1].responsible, BTreeSet::from([ui.id]));
        assert_eq!(report.unsatisfied[2].responsible, BTreeSet::from([api.id]));
        assert!(!report.is_satisfied());
    }

    #[tokio::test]
    async fn broken_sandbox_never_satisfies() {
        #[derive(Debug)]
        struct Down;

        #[async_trait::async_trait]
        impl WorkspaceSandbox for Down {
            async fn write_file(&self, _: &WorkspacePath, _: &[u8]) -> crate::ForgeResult<()> {
                Ok(())
            }
            async fn read_file(&self, _: &WorkspacePath) -> crate::ForgeResult<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn delete_file(&self, _: &WorkspacePath) -> crate::ForgeResult<()> {
                Ok(())
            }
            async fn exec(&self, _: &str) -> crate::ForgeResult<ExecOutput> {
                Err(crate::ForgeError::Sandbox("container gone".into()))
            }
        }

        let contract = contract(vec![VerificationMethod::CommandSucceeds {
            command: "true".into(),
            expect_stdout: None,
        }]);
        let sandbox: Arc<dyn WorkspaceSandbox> = Arc::new(Down);
        let only = component("app", &["index.ts"], &[]);
        let report = SatisfactionGate
            .evaluate(&contract, &snapshot(&[]), &sandbox, &[only.clone()])
            .await;
        assert!(!report.is_satisfied());
        assert!(report.unsatisfied[0].detail.contains("could not run"));
        assert_eq!(report.responsible(), BTreeSet::from([only.id]));
    }

    proptest! {
        #[test]
        fn evaluation_is_idempotent(present in proptest::collection::vec(any::<bool>(), 1..6)) {
            let files: Vec<String> = (0..present.len()).map(|i| format!("src/f{i}.ts")).collect();
            let contract = contract(
                files.iter().map(|f| VerificationMethod::FileExists { path: p(f) }).collect(),
            );
            let written: Vec<(&str, &str)> = files
                .iter()
                .zip(&present)
                .filter(|(_, keep)| **keep)
                .map(|(f, _)| (f.as_str(), "export {};\n"))
                .collect();
            let snap = snapshot(&written);
            let components = vec![component("app", &files.iter().map(String::as_str).collect::<Vec<_>>(), &[])];
            let sandbox = sandbox();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let first = rt.block_on(SatisfactionGate.evaluate(&contract, &snap, &sandbox, &components));
            let second = rt.block_on(SatisfactionGate.evaluate(&contract, &snap, &sandbox, &components));
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.satisfied.len(), present.iter().filter(|b| **b).count());
        }
    }
}
