mod common;

use common::{deploy, harness, vars, wait_until, TIMEOUT};
use orchestra_core::{
    EventClass, EventPayload, ExecutionStatus, NodeState, StepOutcome,
};
use serde_json::json;

const LINEAR: &str = r#"
domain: test.linear
name: Linear
nodes:
  - { id: begin, type: start, next: [work] }
  - id: work
    type: task
    component: test.set
    config: { output: { greeting: hello } }
    next: [finish]
  - { id: finish, type: end }
"#;

#[tokio::test]
async fn test_linear_run_completes() {
    let h = harness().await;
    deploy(&h.runtime, LINEAR).await;

    let id = h.runtime.trigger("test.linear", vars(json!({"name": "ada"}))).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let history: Vec<ExecutionStatus> = execution.status_history.iter().map(|c| c.status).collect();
    assert_eq!(
        history,
        vec![ExecutionStatus::Created, ExecutionStatus::Running, ExecutionStatus::Completed]
    );
    assert_eq!(execution.context.variables["greeting"], json!("hello"));
    assert_eq!(execution.context.variables["name"], json!("ada"));
    assert_eq!(execution.context.state_of("end_finish"), Some(NodeState::Done));
    assert!(execution.node_executions.iter().all(|n| n.state == NodeState::Done));

    let events = h.runtime.events().find_by_execution(&id).await.unwrap();
    let count = |class: EventClass| events.iter().filter(|e| e.class() == class).count();
    assert_eq!(count(EventClass::ActivationRequest), 2);
    assert_eq!(count(EventClass::ActivationResponse), 2);
    assert_eq!(count(EventClass::InvocationRequest), 1);
    assert_eq!(count(EventClass::InvocationResponse), 1);
    assert!(events.iter().all(|e| e.is_processed()));
}

#[tokio::test]
async fn test_failing_component_fails_the_run() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.failing
nodes:
  - { id: begin, type: start, next: [explode] }
  - { id: explode, type: task, component: test.boom, next: [finish] }
  - { id: finish, type: end }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.failing", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.clone().unwrap();
    assert_eq!(error.node_key, "task_explode");
    assert_eq!(error.message, "boom");

    let record = execution.executions_of("task_explode").next().unwrap();
    assert_eq!(record.state, NodeState::Failed);
    assert_eq!(record.error.as_deref(), Some("boom"));
    assert!(execution.executions_of("end_finish").next().is_none());
    assert_ne!(execution.context.state_of("end_finish"), Some(NodeState::Done));
}

#[tokio::test]
async fn test_unknown_component_is_rejected_at_activation() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.unknown
nodes:
  - { id: begin, type: start, next: [ghost] }
  - { id: ghost, type: task, component: nobody.home }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.unknown", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.unwrap();
    assert_eq!(error.node_key, "task_ghost");
    assert!(error.message.contains("not found"), "{}", error.message);
}

#[tokio::test]
async fn test_bad_configuration_rejects_activation() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.strict
nodes:
  - { id: begin, type: start, next: [picky] }
  - { id: picky, type: task, component: test.strict }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.strict", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().message.contains("missing key: required"));

    let events = h.runtime.events().find_by_execution(&id).await.unwrap();
    assert!(!events.iter().any(|e| e.class() == EventClass::InvocationRequest));
}

#[tokio::test]
async fn test_decision_fan_out_shares_causation() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.fanout
nodes:
  - { id: begin, type: start, next: [prepare] }
  - { id: prepare, type: task, component: test.set, next: [split] }
  - { id: split, type: decision, next: [left, right] }
  - { id: left, type: task, component: test.set, next: [finish] }
  - { id: right, type: task, component: test.set, next: [finish] }
  - { id: finish, type: end }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.fanout", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let events = h.runtime.events().find_by_execution(&id).await.unwrap();
    let response = events
        .iter()
        .find(|e| e.class() == EventClass::InvocationResponse && e.payload.node_key() == Some("task_prepare"))
        .unwrap();
    let branches: Vec<_> = events
        .iter()
        .filter(|e| {
            e.class() == EventClass::ActivationRequest
                && matches!(e.payload.node_key(), Some("task_left") | Some("task_right"))
        })
        .collect();

    assert_eq!(branches.len(), 2);
    assert_ne!(branches[0].correlation_id, branches[1].correlation_id);
    for branch in &branches {
        assert_eq!(branch.causation_id.as_ref().unwrap().as_str(), response.event_id.as_str());
    }

    let decision = execution.context.latest_decision("decision_split").unwrap();
    assert_eq!(decision.chosen(), vec!["task_left", "task_right"]);
}

#[tokio::test]
async fn test_guarded_decision_takes_default_flow() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.guarded
nodes:
  - { id: begin, type: start, next: [route] }
  - { id: route, type: decision, next: [big, small] }
  - id: big
    type: task
    component: test.set
    condition: "amount > `10`"
    config: { output: { size: big } }
  - id: small
    type: task
    component: test.set
    default: true
    config: { output: { size: small } }
"#,
    )
    .await;

    let low = h.runtime.trigger("test.guarded", vars(json!({"amount": 5}))).await.unwrap();
    let high = h.runtime.trigger("test.guarded", vars(json!({"amount": 50}))).await.unwrap();

    let low = h.runtime.wait_for_terminal(&low, TIMEOUT).await.unwrap();
    let high = h.runtime.wait_for_terminal(&high, TIMEOUT).await.unwrap();

    assert_eq!(low.status, ExecutionStatus::Completed);
    assert_eq!(low.context.variables["size"], json!("small"));
    assert!(low.executions_of("task_big").next().is_none());

    assert_eq!(high.status, ExecutionStatus::Completed);
    assert_eq!(high.context.variables["size"], json!("big"));
    assert!(high.executions_of("task_small").next().is_none());
}

#[tokio::test]
async fn test_decision_without_match_fails() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.nomatch
nodes:
  - { id: begin, type: start, next: [route] }
  - { id: route, type: decision, next: [only] }
  - { id: only, type: task, component: test.set, condition: "flag" }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.nomatch", vars(json!({"flag": false}))).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().node_key, "decision_route");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_waits_for_both_branches_and_merges() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.join
nodes:
  - { id: begin, type: start, next: [split] }
  - { id: split, type: decision, next: [fast, slow] }
  - id: fast
    type: task
    component: test.set
    config: { output: { fast: 1, winner: fast } }
    next: [meet]
  - id: slow
    type: task
    component: test.set
    config: { output: { slow: 2, winner: slow }, delayMs: 50 }
    next: [meet]
  - { id: meet, type: wait, merge: MERGE, next: [after] }
  - { id: after, type: task, component: test.set, next: [finish] }
  - { id: finish, type: end }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.join", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.executions_of("wait_meet").count(), 1);
    assert_eq!(execution.executions_of("task_after").count(), 1);

    let join = execution.executions_of("wait_meet").next().unwrap();
    let fast_done = execution.last_done("task_fast").unwrap().completed_date.unwrap();
    let slow_done = execution.last_done("task_slow").unwrap().completed_date.unwrap();
    assert!(join.created_date >= fast_done);
    assert!(join.created_date >= slow_done);

    let after = execution.last_done("task_after").unwrap();
    assert_eq!(after.stage_context.variables["fast"], json!(1));
    assert_eq!(after.stage_context.variables["slow"], json!(2));
    assert_eq!(after.stage_context.variables["winner"], json!("slow"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_waits_for_both_branches_in_either_order() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.join.reversed
nodes:
  - { id: begin, type: start, next: [split] }
  - { id: split, type: decision, next: [first, second] }
  - id: first
    type: task
    component: test.set
    config: { output: { first: 1, winner: first }, delayMs: 50 }
    next: [meet]
  - id: second
    type: task
    component: test.set
    config: { output: { second: 2, winner: second } }
    next: [meet]
  - { id: meet, type: wait, merge: MERGE, next: [after] }
  - { id: after, type: task, component: test.set, next: [finish] }
  - { id: finish, type: end }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.join.reversed", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.executions_of("wait_meet").count(), 1);
    assert_eq!(execution.executions_of("task_after").count(), 1);

    let join = execution.executions_of("wait_meet").next().unwrap();
    let first_done = execution.last_done("task_first").unwrap().completed_date.unwrap();
    assert!(join.created_date >= first_done);

    let after = execution.last_done("task_after").unwrap();
    assert_eq!(after.stage_context.variables["first"], json!(1));
    assert_eq!(after.stage_context.variables["second"], json!(2));
    assert_eq!(after.stage_context.variables["winner"], json!("first"));
}

#[tokio::test]
async fn test_join_stays_closed_after_failed_predecessor() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.join.failed
nodes:
  - { id: begin, type: start, next: [split] }
  - { id: split, type: decision, next: [bad, good] }
  - { id: bad, type: task, component: test.boom, next: [meet] }
  - id: good
    type: task
    component: test.set
    config: { delayMs: 60 }
    next: [meet]
  - { id: meet, type: wait, next: [after] }
  - { id: after, type: task, component: test.set }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.join.failed", Default::default()).await.unwrap();
    let execution = wait_until(&h.runtime, &id, |e| {
        e.last_done("task_good").is_some() && e.status == ExecutionStatus::Failed
    })
    .await;

    assert_eq!(execution.error.as_ref().unwrap().node_key, "task_bad");
    assert!(execution.executions_of("wait_meet").next().is_none());
    assert!(execution.executions_of("task_after").next().is_none());
    assert_ne!(execution.context.state_of("wait_meet"), Some(NodeState::Done));
}

#[tokio::test]
async fn test_fan_out_keeps_every_branch_output() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.fanout.vars
nodes:
  - { id: begin, type: start, next: [split] }
  - { id: split, type: decision, next: [a, b] }
  - { id: a, type: task, component: test.set, config: { output: { x: 1 } } }
  - { id: b, type: task, component: test.set, config: { output: { y: 2 }, delayMs: 60 } }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.fanout.vars", vars(json!({"seed": true}))).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.context.variables["x"], json!(1));
    assert_eq!(execution.context.variables["y"], json!(2));
    assert_eq!(execution.context.variables["seed"], json!(true));
}

#[tokio::test]
async fn test_join_skips_branches_not_taken() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.partial
nodes:
  - { id: begin, type: start, next: [route] }
  - { id: route, type: decision, next: [yes, no] }
  - { id: yes, type: task, component: test.set, condition: "go", next: [meet] }
  - { id: no, type: task, component: test.set, condition: "!go", next: [meet] }
  - { id: meet, type: wait, next: [finish] }
  - { id: finish, type: end }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.partial", vars(json!({"go": true}))).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.executions_of("task_no").next().is_none());
    assert_eq!(execution.executions_of("wait_meet").count(), 1);
}

#[tokio::test]
async fn test_failed_run_lets_siblings_finish() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.siblings
nodes:
  - { id: begin, type: start, next: [split] }
  - { id: split, type: decision, next: [bad, good] }
  - { id: bad, type: task, component: test.boom }
  - id: good
    type: task
    component: test.set
    config: { delayMs: 30 }
"#,
    )
    .await;

    let id = h.runtime.trigger("test.siblings", Default::default()).await.unwrap();
    let execution = wait_until(&h.runtime, &id, |e| {
        e.last_done("task_good").is_some() && e.status == ExecutionStatus::Failed
    })
    .await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().node_key, "task_bad");
}

#[tokio::test]
async fn test_replayed_event_changes_nothing() {
    let h = harness().await;
    deploy(&h.runtime, LINEAR).await;
    let id = h.runtime.trigger("test.linear", Default::default()).await.unwrap();
    let before = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();

    let events = h.runtime.events().find_by_execution(&id).await.unwrap();
    let response = events
        .iter()
        .find(|e| e.class() == EventClass::InvocationResponse)
        .cloned()
        .unwrap();
    assert!(matches!(
        &response.payload,
        EventPayload::InvocationResponse { outcome: StepOutcome::Success { .. }, .. }
    ));

    let outputs = h.runtime.dispatcher().dispatch(response).await.unwrap();
    assert!(outputs.is_empty());

    let after = h.runtime.execution(&id).await.unwrap();
    assert_eq!(after.node_executions.len(), before.node_executions.len());
    assert_eq!(after.status_history.len(), before.status_history.len());
    assert_eq!(
        h.runtime.events().find_by_execution(&id).await.unwrap().len(),
        events.len()
    );
}

#[tokio::test]
async fn test_redeploy_merges_by_domain() {
    let h = harness().await;
    deploy(&h.runtime, LINEAR).await;
    deploy(
        &h.runtime,
        r#"
domain: test.linear
name: Linear v2
nodes:
  - { id: begin, type: start, next: [work] }
  - id: work
    type: task
    component: test.set
    config: { output: { greeting: bonjour } }
"#,
    )
    .await;

    let all = h.runtime.workflows().get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "Linear v2");

    let id = h.runtime.trigger("test.linear", Default::default()).await.unwrap();
    let execution = h.runtime.wait_for_terminal(&id, TIMEOUT).await.unwrap();
    assert_eq!(execution.context.variables["greeting"], json!("bonjour"));
    assert!(execution.executions_of("end_finish").next().is_none());
}

#[tokio::test]
async fn test_inactive_workflow_cannot_start() {
    let h = harness().await;
    deploy(
        &h.runtime,
        r#"
domain: test.inactive
active: false
nodes:
  - { id: begin, type: start }
"#,
    )
    .await;

    let err = h.runtime.trigger("test.inactive", Default::default()).await.unwrap_err();
    assert!(matches!(err, orchestra_core::CoreError::ValidationError(_)));

    let missing = h.runtime.trigger("test.absent", Default::default()).await.unwrap_err();
    assert!(matches!(missing, orchestra_core::CoreError::NotFound { .. }));
}
