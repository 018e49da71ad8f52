//! End-to-end engine tests: start/advance/resume against a real SQLite
//! store and on-disk workflow definitions, with the stub AI client.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use waypoint_core::ai::{AiDecision, StubAiClient};
use waypoint_core::db::Database;
use waypoint_core::definitions::WorkflowDefinitionService;
use waypoint_core::engine::{OrchestrationEngine, COMPLETED_INSTRUCTIONS, FAILED_INSTRUCTIONS};
use waypoint_core::error::{EngineError, PersistenceError};
use waypoint_core::models::{InstanceStatus, StepReport, FINISH_STEP};
use waypoint_core::store::InstanceStore;

fn write_step(dir: &Path, name: &str, guidance: &str, instructions: &str) {
    std::fs::write(
        dir.join(format!("{}.md", name)),
        format!(
            "# Orchestrator Guidance\n\n{}\n\n# Client Instructions\n\n{}\n",
            guidance, instructions
        ),
    )
    .unwrap();
}

/// GREET: greet -> farewell. TRIPLE: stepA -> stepB -> stepC.
fn write_fixtures(base: &Path) {
    let greet = base.join("GREET");
    std::fs::create_dir_all(greet.join("steps")).unwrap();
    std::fs::write(
        greet.join("index.md"),
        "# Greeting\n\n- [greet](steps/greet.md)\n- [farewell](steps/farewell.md)\n",
    )
    .unwrap();
    write_step(&greet.join("steps"), "greet", "Then say farewell.", "Say hello.");
    write_step(&greet.join("steps"), "farewell", "Then finish.", "Say goodbye.");

    let triple = base.join("TRIPLE");
    std::fs::create_dir_all(triple.join("steps")).unwrap();
    std::fs::write(
        triple.join("index.md"),
        "# Triple\n\n1. [stepA](steps/a.md)\n2. [stepB](steps/b.md)\n3. [stepC](steps/c.md)\n",
    )
    .unwrap();
    write_step(&triple.join("steps"), "a", "Go to stepB.", "Do A.");
    write_step(&triple.join("steps"), "b", "Go to stepC.", "Do B.");
    write_step(&triple.join("steps"), "c", "Finish.", "Do C.");
}

struct Harness {
    _dir: tempfile::TempDir,
    engine: Arc<OrchestrationEngine>,
    store: InstanceStore,
    stub: Arc<StubAiClient>,
}

fn harness(stub: StubAiClient) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(dir.path());

    let db = Database::open_in_memory().unwrap();
    let definitions = Arc::new(WorkflowDefinitionService::new(dir.path()));
    let stub = Arc::new(stub);
    let engine = Arc::new(OrchestrationEngine::new(
        definitions,
        InstanceStore::new(db.clone()),
        stub.clone(),
    ));

    Harness {
        _dir: dir,
        engine,
        store: InstanceStore::new(db),
        stub,
    }
}

fn report(status: &str) -> StepReport {
    serde_json::from_value(json!({ "status": status })).unwrap()
}

fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_happy_path_two_step_workflow() {
    let h = harness(StubAiClient::new());

    let started = h.engine.start_workflow("GREET", None).await.unwrap();
    assert_eq!(started.next_step.step_name, "greet");
    assert_eq!(started.next_step.instructions, "Say hello.");
    let id = started.instance_id.clone();

    // No history is recorded at start.
    assert!(h.store.recent_history(&id, 10).await.unwrap().is_empty());

    let advanced = h
        .engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();
    assert_eq!(advanced.next_step.step_name, "farewell");
    assert_eq!(advanced.next_step.instructions, "Say goodbye.");

    let finished = h
        .engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();
    assert_eq!(finished.next_step.step_name, FINISH_STEP);
    assert_eq!(finished.next_step.instructions, COMPLETED_INSTRUCTIONS);

    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.current_step_name.as_deref(), Some(FINISH_STEP));
    assert!(instance.completed_at.is_some());

    let history = h.store.recent_history(&id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    // Most recent first: the farewell report, then the greet report.
    assert_eq!(history[0].step_name, "farewell");
    assert_eq!(history[0].determined_next_step.as_deref(), Some(FINISH_STEP));
    assert_eq!(history[1].step_name, "greet");
    assert_eq!(history[1].outcome_status.as_deref(), Some("success"));
}

#[tokio::test]
async fn test_start_context_merge_ai_overrides_client() {
    let stub = StubAiClient::new()
        .with_first_step(AiDecision::next("greet").with_update("a", json!(9)));
    let h = harness(stub);

    let started = h
        .engine
        .start_workflow("GREET", Some(context(&[("a", json!(1)), ("b", json!(2))])))
        .await
        .unwrap();

    assert_eq!(started.current_context["a"], json!(9));
    assert_eq!(started.current_context["b"], json!(2));

    let stored = h.store.get(&started.instance_id).await.unwrap();
    assert_eq!(stored.context["a"], json!(9));
    assert_eq!(stored.context["b"], json!(2));
}

#[tokio::test]
async fn test_advance_client_then_ai_context_precedence() {
    let stub = StubAiClient::new()
        .with_next("greet", AiDecision::next("farewell").with_update("x", json!(5)));
    let h = harness(stub);

    let started = h
        .engine
        .start_workflow("GREET", Some(context(&[("x", json!(1))])))
        .await
        .unwrap();

    let advanced = h
        .engine
        .advance_workflow(
            &started.instance_id,
            &report("success"),
            Some(context(&[("x", json!(2)), ("y", json!(3))])),
        )
        .await
        .unwrap();

    assert_eq!(advanced.current_context["x"], json!(5));
    assert_eq!(advanced.current_context["y"], json!(3));
}

#[tokio::test]
async fn test_resume_reconciliation_records_assumed_step() {
    let stub = StubAiClient::new().with_resume("stepA", AiDecision::next("stepC"));
    let h = harness(stub);

    let started = h.engine.start_workflow("TRIPLE", None).await.unwrap();
    let id = started.instance_id.clone();

    // Move the persisted state to stepB first.
    h.engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();
    assert_eq!(
        h.store.get(&id).await.unwrap().current_step_name.as_deref(),
        Some("stepB")
    );

    // The client reconnects believing it is still on stepA.
    let resumed = h
        .engine
        .resume_workflow(&id, "stepA", &report("resuming"), None)
        .await
        .unwrap();
    assert_eq!(resumed.next_step.step_name, "stepC");
    assert_eq!(resumed.next_step.instructions, "Do C.");

    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.current_step_name.as_deref(), Some("stepC"));

    let history = h.store.recent_history(&id, 1).await.unwrap();
    assert_eq!(history[0].step_name, "stepA");
    assert_eq!(history[0].outcome_status.as_deref(), Some("RESUMING"));
}

#[tokio::test]
async fn test_advance_unknown_instance_is_not_found() {
    let h = harness(StubAiClient::new());

    let err = h
        .engine
        .advance_workflow("nope", &report("success"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Persistence(PersistenceError::InstanceNotFound(_))
    ));
    assert!(h.store.recent_history("nope", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ai_timeout_retried_transparently() {
    let h = harness(StubAiClient::new().with_timeout_once());

    // Create the instance directly so the timeout hits the advance call.
    let instance = waypoint_core::models::WorkflowInstance::new(
        "GREET".to_string(),
        Some("greet".to_string()),
        InstanceStatus::Running,
        Map::new(),
    );
    h.store.create(&instance).await.unwrap();

    let advanced = h
        .engine
        .advance_workflow(&instance.instance_id, &report("success"), None)
        .await
        .unwrap();
    assert_eq!(advanced.next_step.step_name, "farewell");

    assert_eq!(h.stub.retries(), 1);
    assert_eq!(h.stub.successes(), 1);
    let history = h
        .store
        .recent_history(&instance.instance_id, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_failure_report_reaches_failed_without_completion_stamp() {
    let h = harness(StubAiClient::new());

    let started = h.engine.start_workflow("GREET", None).await.unwrap();
    let id = started.instance_id.clone();

    let failed = h
        .engine
        .advance_workflow(&id, &report("failure"), None)
        .await
        .unwrap();
    assert_eq!(failed.next_step.instructions, FAILED_INSTRUCTIONS);

    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.completed_at.is_none());
}

#[tokio::test]
async fn test_terminal_instance_ignores_further_advances() {
    let h = harness(StubAiClient::new());

    let started = h.engine.start_workflow("GREET", None).await.unwrap();
    let id = started.instance_id.clone();
    h.engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();
    h.engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();

    let before = h.store.get(&id).await.unwrap();
    assert_eq!(before.status, InstanceStatus::Completed);

    let echoed = h
        .engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap();
    assert_eq!(echoed.next_step.step_name, FINISH_STEP);
    assert_eq!(echoed.next_step.instructions, COMPLETED_INSTRUCTIONS);

    let after = h.store.get(&id).await.unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(h.store.recent_history(&id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_suspend_then_resume_back_to_running() {
    let stub = StubAiClient::new()
        .with_next(
            "greet",
            AiDecision::next("greet").with_status(InstanceStatus::Suspended),
        )
        .with_resume(
            "greet",
            AiDecision::next("farewell").with_status(InstanceStatus::Running),
        );
    let h = harness(stub);

    let started = h.engine.start_workflow("GREET", None).await.unwrap();
    let id = started.instance_id.clone();

    h.engine
        .advance_workflow(&id, &report("in_progress"), None)
        .await
        .unwrap();
    assert_eq!(
        h.store.get(&id).await.unwrap().status,
        InstanceStatus::Suspended
    );

    h.engine
        .resume_workflow(&id, "greet", &report("resuming"), None)
        .await
        .unwrap();
    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.current_step_name.as_deref(), Some("farewell"));
}

#[tokio::test]
async fn test_hallucinated_next_step_fails_workflow() {
    let stub = StubAiClient::new().with_next("greet", AiDecision::next("ghost"));
    let h = harness(stub);

    let started = h.engine.start_workflow("GREET", None).await.unwrap();
    let id = started.instance_id.clone();

    let err = h
        .engine
        .advance_workflow(&id, &report("success"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));

    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_concurrent_advances_serialize() {
    let h = harness(StubAiClient::new());

    let started = h.engine.start_workflow("TRIPLE", None).await.unwrap();
    let id = started.instance_id.clone();

    let e1 = h.engine.clone();
    let e2 = h.engine.clone();
    let id1 = id.clone();
    let id2 = id.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { e1.advance_workflow(&id1, &report("success"), None).await }),
        tokio::spawn(async move { e2.advance_workflow(&id2, &report("success"), None).await }),
    );
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    // Each history entry's step matches the instance's step right
    // before its commit: stepA first, then stepB.
    let history = h.store.recent_history(&id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].step_name, "stepA");
    assert_eq!(history[0].step_name, "stepB");
    assert!(history[0].history_id > history[1].history_id);

    let instance = h.store.get(&id).await.unwrap();
    assert_eq!(instance.current_step_name.as_deref(), Some("stepC"));
}

#[tokio::test]
async fn test_get_status_projection() {
    let h = harness(StubAiClient::new());
    let started = h.engine.start_workflow("GREET", None).await.unwrap();

    let instance = h.engine.get_status(&started.instance_id).await.unwrap();
    assert_eq!(instance.workflow_name, "GREET");
    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(instance.updated_at >= instance.created_at);
}

#[tokio::test]
async fn test_start_unknown_workflow_is_not_found() {
    let h = harness(StubAiClient::new());
    let err = h.engine.start_workflow("MISSING", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));
}
