use forge_core::contract::{ContractAmendment, CriterionDraft, VerificationMethod};
use forge_core::escalation::EscalationLevel;
use forge_core::events::EventKind;
use forge_core::ports::GenerationMode;
use forge_core::swarm::VerificationSwarm;
use forge_kernel::{Phase, SessionStatus};
use forge_test_utils::{
    clean_criterion, engine, fast_config, flat_plan, locked_contract, path, CrashingChecker, Reply, ScriptedGenerator,
};
use std::sync::Arc;
use std::time::Duration;

fn criteria(names: &[&str]) -> Vec<(String, String)> {
    names
        .iter()
        .map(|n| clean_criterion(&format!("src/{n}/index.ts")))
        .collect()
}

fn as_refs(pairs: &[(String, String)]) -> Vec<(&str, &str)> {
    pairs.iter().map(|(p, t)| (p.as_str(), t.as_str())).collect()
}

fn escalation_levels(events: &[forge_core::ProgressEvent]) -> Vec<EscalationLevel> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Escalation { level, .. } => Some(*level),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn clean_build_completes_with_components_in_parallel() {
    let mut pairs = criteria(&["alpha", "beta"]);
    pairs.push(("src/alpha/index.ts".into(), "'src/alpha/index.ts'".into()));
    let contract = locked_contract("two parts", &as_refs(&pairs));

    let generator = Arc::new(ScriptedGenerator::new().with_delay(Duration::from_millis(100)));
    let engine = engine(Arc::clone(&generator), flat_plan(&["alpha", "beta"]), fast_config());
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_phase, Phase::Terminal);
    assert_eq!(session.escalation_level, None);
    let summary = session.summary.unwrap();
    assert_eq!(summary.components_merged, 2);
    assert_eq!(summary.generation_calls, 2);
    assert_eq!(generator.peak_concurrency(), 2);

    let gates: Vec<usize> = engine
        .history(id)
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::GateEvaluated { satisfied, unsatisfied } => {
                assert!(unsatisfied.is_empty());
                Some(*satisfied)
            }
            _ => None,
        })
        .collect();
    assert_eq!(gates, vec![3]);

    let snapshot = engine.snapshot(id).unwrap();
    assert_eq!(snapshot.owner_of(&path("src/beta/index.ts")), Some("beta"));
}

#[tokio::test]
async fn unmet_criterion_rebuilds_only_its_component() {
    let mut pairs = criteria(&["a", "b", "d", "e"]);
    pairs.push(("src/c/index.ts".into(), "export const renderChart".into()));
    let contract = locked_contract("five parts", &as_refs(&pairs));

    let generator = Arc::new(ScriptedGenerator::new().script(
        "c",
        [
            Reply::Clean,
            Reply::Files(vec![(
                "src/c/index.ts".into(),
                "export const renderChart = () => 'chart';\n".into(),
            )]),
        ],
    ));
    let engine = engine(Arc::clone(&generator), flat_plan(&["a", "b", "c", "d", "e"]), fast_config());
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(generator.modes_for("c"), vec![GenerationMode::Build, GenerationMode::GapFix]);
    for name in ["a", "b", "d", "e"] {
        assert_eq!(generator.modes_for(name), vec![GenerationMode::Build], "{name} was rebuilt");
    }

    let unsatisfied: Vec<usize> = engine
        .history(id)
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::GateEvaluated { unsatisfied, .. } => Some(unsatisfied.len()),
            _ => None,
        })
        .collect();
    assert_eq!(unsatisfied, vec![1, 0]);
    // The gap fix was a loop back, not an escalation
    assert_eq!(session.escalation_level, None);
}

#[tokio::test]
async fn checker_crash_escalates_from_local_fix_and_never_completes() {
    let config = fast_config().with_uniform_escalation_budget(1);
    let swarm = VerificationSwarm::standard(&config.swarm).with_checker(Arc::new(CrashingChecker::new("crasher")));
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));

    let generator = Arc::new(ScriptedGenerator::new());
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config).with_swarm(swarm);
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::PausedNeedsInput);
    assert!(session.summary.is_none());
    assert!(session.unresolved_findings.iter().any(|f| f.is_internal_error()));

    let events = engine.history(id);
    let levels = escalation_levels(&events);
    assert_eq!(levels.first(), Some(&EscalationLevel::LocalFix));
    assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(levels.last(), Some(&EscalationLevel::FeatureRewrite));
    assert!(!events.iter().any(|e| matches!(e.kind, EventKind::Completed(_))));
}

#[tokio::test]
async fn exhausted_ladder_jumps_to_feature_rewrite_then_pauses() {
    let config = fast_config().with_uniform_escalation_budget(0);
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let generator = Arc::new(ScriptedGenerator::new().always("ui", Reply::Todo));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config);
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::PausedNeedsInput);
    assert_eq!(session.escalation_level, Some(EscalationLevel::FeatureRewrite));
    assert!(session.pause_reason.is_some());
    assert!(session
        .unresolved_findings
        .iter()
        .any(|f| f.tag.as_deref() == Some("todo-marker")));
    assert_eq!(
        escalation_levels(&engine.history(id)),
        vec![EscalationLevel::FeatureRewrite]
    );
    assert_eq!(
        generator.modes_for("ui"),
        vec![GenerationMode::Build, GenerationMode::FeatureRewrite]
    );
}

#[tokio::test]
async fn feature_rewrite_failing_differently_still_pauses() {
    let config = fast_config().with_uniform_escalation_budget(0);
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let generator = Arc::new(ScriptedGenerator::new().script(
        "ui",
        [Reply::Todo, Reply::Fail("model refused".into())],
    ));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config);
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::PausedNeedsInput);
    assert_eq!(
        escalation_levels(&engine.history(id)),
        vec![EscalationLevel::FeatureRewrite]
    );
    // The rewrite was not retried under the new signature
    assert_eq!(
        generator.modes_for("ui"),
        vec![GenerationMode::Build, GenerationMode::FeatureRewrite]
    );
}

#[tokio::test]
async fn generation_timeout_enters_the_ladder_and_recovers() {
    let config = fast_config()
        .with_generation_timeout(Duration::from_millis(200))
        .with_uniform_escalation_budget(1);
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let generator = Arc::new(ScriptedGenerator::new().script("ui", [Reply::Hang]));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config);
    let id = engine.start_with_contract(contract).unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.escalation_level, Some(EscalationLevel::LocalFix));
    let steps: Vec<(EscalationLevel, String)> = engine
        .history(id)
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Escalation { level, signature, .. } => Some((*level, signature.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].0, EscalationLevel::LocalFix);
    assert!(steps[0].1.contains("generation-timeout"), "{}", steps[0].1);
    assert_eq!(
        generator.modes_for("ui"),
        vec![GenerationMode::Build, GenerationMode::LocalFix]
    );
}

#[tokio::test]
async fn paused_session_resumes_and_keeps_its_escalation_floor() {
    let config = fast_config().with_uniform_escalation_budget(0);
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let generator = Arc::new(ScriptedGenerator::new().script("ui", [Reply::Todo, Reply::Todo]));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config);
    let id = engine.start_with_contract(contract).unwrap();
    assert_eq!(engine.wait(id).await.unwrap().status, SessionStatus::PausedNeedsInput);

    engine.resume(id).await.unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.escalation_level, Some(EscalationLevel::FeatureRewrite));
    assert!(session.pause_reason.is_none());
    assert!(session
        .phase_history
        .iter()
        .any(|r| r.to == Phase::Init && r.from == Phase::Verification));
    assert_eq!(
        generator.modes_for("ui"),
        vec![GenerationMode::Build, GenerationMode::FeatureRewrite, GenerationMode::Build]
    );
}

#[tokio::test]
async fn amendment_replaces_the_contract_of_a_paused_session() {
    let config = fast_config().with_uniform_escalation_budget(0);
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let original = contract.id();
    let original_hash = contract.content_hash();
    let generator = Arc::new(ScriptedGenerator::new().script("ui", [Reply::Todo, Reply::Todo]));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), config);
    let id = engine.start_with_contract(contract).unwrap();
    engine.wait(id).await.unwrap();

    let amended = engine
        .amend_contract(
            id,
            ContractAmendment {
                add: vec![CriterionDraft {
                    description: "ui file exists".into(),
                    method: Some(VerificationMethod::FileExists {
                        path: path("src/ui/index.ts"),
                    }),
                }],
                note: "add an existence check".into(),
                ..ContractAmendment::default()
            },
        )
        .await
        .unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.contract_id, amended);
    assert_eq!(session.superseded_contracts, vec![original]);

    let registry = engine.registry();
    let old = registry.get(original).unwrap();
    assert!(old.is_locked());
    assert_eq!(old.content_hash(), original_hash);
    let new = registry.get(amended).unwrap();
    assert_eq!(new.supersedes(), Some(original));
    assert_eq!(new.criteria().len(), 2);
    assert_eq!(registry.lineage(amended).len(), 2);
}

#[tokio::test]
async fn amending_a_running_or_completed_session_is_refused() {
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let engine = engine(Arc::new(ScriptedGenerator::new()), flat_plan(&["ui"]), fast_config());
    let id = engine.start_with_contract(contract).unwrap();
    assert_eq!(engine.wait(id).await.unwrap().status, SessionStatus::Completed);

    let err = engine
        .amend_contract(id, ContractAmendment::default())
        .await
        .unwrap_err();
    assert!(matches!(err, forge_core::ForgeError::InvalidTransition(_)));
    assert!(engine.resume(id).await.is_err());
}

#[tokio::test]
async fn cancel_aborts_a_session_stuck_in_generation() {
    let contract = locked_contract("one part", &as_refs(&criteria(&["ui"])));
    let generator = Arc::new(ScriptedGenerator::new().always("ui", Reply::Hang));
    let engine = engine(Arc::clone(&generator), flat_plan(&["ui"]), fast_config());
    let id = engine.start_with_contract(contract).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while generator.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.cancel(id).await.unwrap();
    let session = engine.wait(id).await.unwrap();

    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(session.current_phase, Phase::Terminal);
    assert!(session.abort_reason.is_some());
    assert!(engine.snapshot(id).unwrap().is_empty());
    assert!(engine.cancel(id).await.is_ok());
}

#[tokio::test]
async fn unknown_sessions_are_reported() {
    let engine = engine(Arc::new(ScriptedGenerator::new()), flat_plan(&["ui"]), fast_config());
    let err = engine
        .get_session_status(forge_core::SessionId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, forge_core::ForgeError::SessionNotFound(_)));
}
