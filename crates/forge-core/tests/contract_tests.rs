use forge_artifact::ChangeSet;
use forge_core::component::Component;
use forge_core::contract::{ContractAmendment, ContractRegistry, CriterionDraft, IntentContract, VerificationMethod};
use forge_core::error::ForgeError;
use forge_core::gate::SatisfactionGate;
use forge_core::partition::{ArchitecturePlan, ComponentSpec, Partitioner};
use forge_core::ports::WorkspaceSandbox;
use forge_core::sandbox::MemorySandbox;
use forge_core::types::{CriterionId, SessionId};
use forge_core::workspace::SharedWorkspace;
use forge_test_utils::{locked_contract, path};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn criterion(file: &str, text: &str) -> CriterionDraft {
    CriterionDraft {
        description: format!("{file} mentions {text}"),
        method: Some(VerificationMethod::FileContains {
            path: path(file),
            text: text.into(),
        }),
    }
}

#[test]
fn locked_contract_rejects_every_mutation() {
    let mut contract = locked_contract("todo app", &[("src/app.ts", "export")]);
    let hash = contract.content_hash();

    assert!(matches!(
        contract.add_criterion(criterion("src/b.ts", "b")),
        Err(ForgeError::ContractLocked(_))
    ));
    assert!(matches!(
        contract.remove_criterion(&CriterionId("C1".into())),
        Err(ForgeError::ContractLocked(_))
    ));
    assert_eq!(contract.content_hash(), hash);
    assert_eq!(contract.criteria().len(), 1);
}

#[test]
fn drafts_without_criteria_do_not_lock() {
    let mut contract = IntentContract::draft("something vague");
    assert!(contract.lock().is_err());
    assert!(!contract.is_locked());
}

#[test]
fn amendment_chains_a_new_contract() {
    let base = locked_contract("todo app", &[("src/app.ts", "export"), ("src/store.ts", "persist")]);
    let amended = base
        .amend(ContractAmendment {
            add: vec![criterion("src/ui.ts", "render")],
            remove: vec![CriterionId("C1".into())],
            note: "drop the app check".into(),
            ..ContractAmendment::default()
        })
        .unwrap();

    assert!(amended.is_locked());
    assert_ne!(amended.id(), base.id());
    assert_eq!(amended.supersedes(), Some(base.id()));
    assert_eq!(amended.amendment_note(), Some("drop the app check"));
    let ids: Vec<&str> = amended.criteria().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["C2", "C3"]);
    assert_eq!(base.criteria().len(), 2);
}

#[test]
fn registry_refuses_drafts_and_duplicates() {
    let registry = ContractRegistry::new();
    let draft = IntentContract::draft("draft");
    assert!(matches!(
        registry.insert(draft),
        Err(ForgeError::ContractGeneration { .. })
    ));

    let base = locked_contract("todo app", &[("src/app.ts", "export")]);
    let id = base.id();
    registry.insert(base.clone()).unwrap();
    assert!(matches!(registry.insert(base.clone()), Err(ForgeError::ContractLocked(_))));

    let amended = registry
        .insert(
            base.amend(ContractAmendment {
                add: vec![criterion("src/ui.ts", "render")],
                note: "ui".into(),
                ..ContractAmendment::default()
            })
            .unwrap(),
        )
        .unwrap();
    let lineage: Vec<_> = registry.lineage(amended.id()).iter().map(|c| c.id()).collect();
    assert_eq!(lineage.len(), 2);
    assert!(lineage.contains(&id));
    assert_eq!(registry.len(), 2);
}

async fn merged(contract: &IntentContract, files: &[(&str, &str, &str)]) -> (SharedWorkspace, Vec<Component>) {
    let owners: Vec<&str> = {
        let mut owners: Vec<&str> = files.iter().map(|(owner, _, _)| *owner).collect();
        owners.dedup();
        owners
    };
    let proposal = ArchitecturePlan::new(
        owners
            .iter()
            .map(|owner| {
                ComponentSpec::new(
                    *owner,
                    files.iter().filter(|(o, _, _)| o == owner).map(|(_, file, _)| *file),
                )
            })
            .collect(),
    );
    let plan = Partitioner.partition(SessionId::new(), contract, &proposal).unwrap();

    let workspace = SharedWorkspace::new(Arc::new(MemorySandbox::new("shared")));
    let mut sets = Vec::new();
    for component in &plan.components {
        workspace.register_claims(&component.name, &component.owned_files).unwrap();
        let mut set = ChangeSet::new(component.name.clone());
        for (_, file, content) in files.iter().filter(|(o, _, _)| *o == component.name) {
            set.write(path(file), content.as_bytes().to_vec());
        }
        sets.push(set);
    }
    workspace.merge(&sets, "fixture", &CancellationToken::new()).await.unwrap();
    (workspace, plan.components)
}

#[tokio::test]
async fn gate_partitions_criteria_and_is_idempotent() {
    let contract = locked_contract(
        "chart app",
        &[
            ("src/core/index.ts", "export const core"),
            ("src/chart/index.ts", "renderChart"),
            ("src/api/index.ts", "export const api"),
        ],
    );
    let (workspace, components) = merged(
        &contract,
        &[
            ("core", "src/core/index.ts", "export const core = 1;\n"),
            ("chart", "src/chart/index.ts", "export const chart = 1;\n"),
            ("api", "src/api/index.ts", "export const api = 1;\n"),
        ],
    )
    .await;
    let snapshot = workspace.snapshot();
    let sandbox: Arc<dyn WorkspaceSandbox> = workspace.sandbox();

    let first = SatisfactionGate
        .evaluate(&contract, &snapshot, &sandbox, &components)
        .await;
    let second = SatisfactionGate
        .evaluate(&contract, &snapshot, &sandbox, &components)
        .await;

    assert_eq!(first, second);
    assert!(!first.is_satisfied());
    assert_eq!(first.satisfied.len() + first.unsatisfied.len(), contract.criteria().len());
    assert_eq!(first.unsatisfied_ids(), vec![CriterionId("C2".into())]);

    let chart = components.iter().find(|c| c.name == "chart").unwrap();
    assert_eq!(first.responsible().into_iter().collect::<Vec<_>>(), vec![chart.id]);
    assert!(first.unsatisfied[0].paths.contains(&path("src/chart/index.ts")));
}
