// Unit tests for the workflow engine: gating, atomic materialization,
// scheduling discipline, failure isolation, and sweep recovery. Everything
// runs against the in-memory store and recording sender; timing tests use
// small real delays rather than a mocked clock.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::channels::{Channel, ChannelSender};
use crate::tests::fixtures;
use crate::workflows::testing::{
    FailingEvaluator, MemoryStore, RecordingSender, StaticEvaluator,
};
use crate::workflows::{
    ActionDispatcher, ActionKind, ActionOutcome, ActionScheduler, ActionStatus, ActionTemplate,
    ConditionEvaluator, EngineError, ExecutionOutcome, ExecutionStatus, SkipReason, Trigger,
    TriggerKind, WorkerPool, WorkflowEngine, WorkflowStore,
};

fn build_engine(
    store: &Arc<MemoryStore>,
    evaluator: Arc<dyn ConditionEvaluator>,
    sender: Arc<dyn ChannelSender>,
) -> (Arc<WorkflowEngine>, WorkerPool) {
    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn.clone(), sender);
    let scheduler = Arc::new(ActionScheduler::new(store_dyn.clone(), dispatcher));
    let pool = WorkerPool::start(scheduler, 2, 16);
    let engine = Arc::new(WorkflowEngine::new(store_dyn, evaluator, pool.handle(), 100));
    (engine, pool)
}

fn build_scheduler(store: &Arc<MemoryStore>, sender: Arc<dyn ChannelSender>) -> ActionScheduler {
    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    ActionScheduler::new(store_dyn.clone(), ActionDispatcher::new(store_dyn, sender))
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================
// Execution creation gating
// ============================================

#[tokio::test]
async fn test_create_execution_materializes_all_actions() {
    let store = Arc::new(MemoryStore::new());
    let template = fixtures::message_template(Channel::Sms, "Hi {{first_name}}");
    store.add_template(template.clone());
    store.add_snapshot(fixtures::snapshot(1));

    let workflow = fixtures::workflow(
        TriggerKind::LeadCreated,
        vec![
            ActionTemplate::send_message(Channel::Sms, template.id).with_delay(60),
            ActionTemplate::create_task("Call {{first_name}}", 1).with_delay(120),
        ],
    );
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::lead_created(1, None, Some("portal")), false)
        .await
        .unwrap();

    assert!(matches!(outcome, ExecutionOutcome::Created { .. }));
    assert_eq!(store.execution_count(), 1);
    assert_eq!(store.action_count(), 2);
}

#[tokio::test]
async fn test_failed_creation_leaves_no_partial_state() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    let workflow = fixtures::workflow(
        TriggerKind::Manual,
        vec![ActionTemplate::wait(5), ActionTemplate::create_task("Follow up", 1)],
    );
    store.add_workflow(workflow.clone());

    store
        .fail_next_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let result = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), false)
        .await;

    assert!(result.is_err());
    // All-or-nothing: neither the execution nor any action survived.
    assert_eq!(store.execution_count(), 0);
    assert_eq!(store.action_count(), 0);
}

#[tokio::test]
async fn test_inactive_workflow_skipped_unless_forced() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    let mut workflow = fixtures::workflow(TriggerKind::Manual, vec![ActionTemplate::wait(60)]);
    workflow.is_active = false;
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), false)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ExecutionOutcome::Skipped(SkipReason::WorkflowInactive)
    ));
    assert_eq!(store.execution_count(), 0);

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), true)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Created { .. }));
}

#[tokio::test]
async fn test_conditions_not_met_skips() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    let workflow = fixtures::workflow(TriggerKind::ScoreChanged, vec![ActionTemplate::wait(60)]);
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(false)),
        Arc::new(RecordingSender::new()),
    );

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::score_changed(1, 10, 90), false)
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ExecutionOutcome::Skipped(SkipReason::ConditionsNotMet)
    ));
    assert_eq!(store.execution_count(), 0);
}

#[tokio::test]
async fn test_evaluator_error_fails_closed() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    let workflow = fixtures::workflow(TriggerKind::Manual, vec![ActionTemplate::wait(60)]);
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(FailingEvaluator),
        Arc::new(RecordingSender::new()),
    );

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), false)
        .await
        .unwrap();

    // An unreachable condition service never lets the workflow run.
    assert!(matches!(
        outcome,
        ExecutionOutcome::Skipped(SkipReason::ConditionsNotMet)
    ));
}

#[tokio::test]
async fn test_unknown_workflow_and_lead_are_not_found() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    let workflow = fixtures::workflow(TriggerKind::Manual, vec![]);
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let result = engine
        .execute_workflow(Uuid::new_v4(), 1, Trigger::manual(), false)
        .await;
    assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));

    let result = engine
        .execute_workflow(workflow.id, 999, Trigger::manual(), false)
        .await;
    assert!(matches!(result, Err(EngineError::LeadNotFound(999))));
}

#[tokio::test]
async fn test_retrigger_is_idempotent_while_execution_open() {
    let store = Arc::new(MemoryStore::new());
    store.add_snapshot(fixtures::snapshot(1));
    // One far-future action keeps the execution non-terminal.
    let workflow = fixtures::workflow(TriggerKind::Manual, vec![ActionTemplate::wait(60)]);
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let first = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), false)
        .await
        .unwrap();
    assert!(matches!(first, ExecutionOutcome::Created { .. }));

    let second = engine
        .execute_workflow(workflow.id, 1, Trigger::manual(), false)
        .await
        .unwrap();
    assert!(matches!(
        second,
        ExecutionOutcome::Skipped(SkipReason::ExecutionInProgress)
    ));
    assert_eq!(store.execution_count(), 1);

    // A different lead is unaffected by the invariant.
    store.add_snapshot(fixtures::snapshot(2));
    let other = engine
        .execute_workflow(workflow.id, 2, Trigger::manual(), false)
        .await
        .unwrap();
    assert!(matches!(other, ExecutionOutcome::Created { .. }));
}

// ============================================
// Scheduling discipline
// ============================================

#[tokio::test]
async fn test_no_early_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Sms, "Hello {{first_name}}");
    store.add_template(template.clone());

    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let scheduled_for = Utc::now() + chrono::Duration::milliseconds(200);
    let action = fixtures::action(execution.id, 0, fixtures::send_sms(template.id), scheduled_for);
    store.create_execution(&execution, &[action]).await.unwrap();

    let scheduler = build_scheduler(&store, sender.clone());
    scheduler.run_execution(execution.id).await.unwrap();

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert!(
        sent[0].sent_at >= scheduled_for,
        "dispatched at {} before scheduled_for {}",
        sent[0].sent_at,
        scheduled_for
    );
}

#[tokio::test]
async fn test_actions_run_in_order_within_execution() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let first_template = fixtures::message_template(Channel::Sms, "first message");
    let second_template = fixtures::message_template(Channel::Sms, "second message");
    store.add_template(first_template.clone());
    store.add_template(second_template.clone());

    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let now = Utc::now();
    let first = fixtures::action(
        execution.id,
        0,
        fixtures::send_sms(first_template.id),
        now + chrono::Duration::milliseconds(50),
    );
    let second = fixtures::action(
        execution.id,
        1,
        fixtures::send_sms(second_template.id),
        now + chrono::Duration::milliseconds(150),
    );
    store
        .create_execution(&execution, &[first.clone(), second.clone()])
        .await
        .unwrap();

    let scheduler = build_scheduler(&store, sender.clone());
    scheduler.run_execution(execution.id).await.unwrap();

    let sent = sender.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body, "first message");
    assert_eq!(sent[1].body, "second message");

    // The earlier action reached a terminal state before the later one started.
    let first_done = store.action(first.id).unwrap().completed_at.unwrap();
    let second_started = store.action(second.id).unwrap().started_at.unwrap();
    assert!(first_done <= second_started);
}

#[tokio::test]
async fn test_action_failure_does_not_stop_siblings() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::failing_on("FAIL"));
    let ok_template = fixtures::message_template(Channel::Sms, "all good");
    let bad_template = fixtures::message_template(Channel::Sms, "FAIL this one");
    let last_template = fixtures::message_template(Channel::Sms, "still delivered");
    store.add_template(ok_template.clone());
    store.add_template(bad_template.clone());
    store.add_template(last_template.clone());

    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let now = Utc::now();
    let actions = vec![
        fixtures::action(execution.id, 0, fixtures::send_sms(ok_template.id), now),
        fixtures::action(
            execution.id,
            1,
            fixtures::send_sms(bad_template.id),
            now + chrono::Duration::milliseconds(30),
        ),
        fixtures::action(
            execution.id,
            2,
            fixtures::send_sms(last_template.id),
            now + chrono::Duration::milliseconds(60),
        ),
    ];
    store.create_execution(&execution, &actions).await.unwrap();

    let scheduler = build_scheduler(&store, sender.clone());
    scheduler.run_execution(execution.id).await.unwrap();

    assert_eq!(store.action(actions[0].id).unwrap().status, ActionStatus::Completed);
    assert_eq!(store.action(actions[1].id).unwrap().status, ActionStatus::Failed);
    assert_eq!(store.action(actions[2].id).unwrap().status, ActionStatus::Completed);

    // A failed action is counted, not fatal: the execution still completes.
    let finished = store.execution(execution.id).unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.actions_completed, 2);
    assert_eq!(finished.actions_failed, 1);
}

#[tokio::test]
async fn test_concurrent_runs_dispatch_each_action_once() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Sms, "only once");
    store.add_template(template.clone());

    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let action = fixtures::action(
        execution.id,
        0,
        fixtures::send_sms(template.id),
        Utc::now() - chrono::Duration::minutes(5),
    );
    store.create_execution(&execution, &[action]).await.unwrap();

    // The sweep racing the creation-time loop: both consume the same
    // execution, the compare-and-set transitions let only one win.
    let scheduler = Arc::new(build_scheduler(&store, sender.clone()));
    let (a, b) = tokio::join!(
        scheduler.run_execution(execution.id),
        scheduler.run_execution(execution.id),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(sender.sent().len(), 1);
    assert_eq!(store.deliveries().len(), 1);
}

// ============================================
// Sweep recovery
// ============================================

#[tokio::test]
async fn test_sweep_recovers_stuck_action_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Sms, "recovered send");
    store.add_template(template.clone());

    // A pending action past its due time, as left behind by a restart.
    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let action = fixtures::action(
        execution.id,
        0,
        fixtures::send_sms(template.id),
        Utc::now() - chrono::Duration::minutes(10),
    );
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let (engine, _pool) = build_engine(&store, Arc::new(StaticEvaluator(true)), sender.clone());

    let sweep = engine.process_pending().await.unwrap();
    assert_eq!(sweep.executions_queued, 1);
    assert_eq!(sweep.actions_total, 1);

    let recovered = {
        let store = store.clone();
        wait_until(move || {
            store
                .action(action.id)
                .map(|a| a.status == ActionStatus::Completed)
                .unwrap_or(false)
        })
        .await
    };
    assert!(recovered, "stuck action was not recovered by the sweep");
    assert_eq!(store.deliveries().len(), 1);

    // Nothing left for the next pass, and no duplicate delivery.
    let sweep = engine.process_pending().await.unwrap();
    assert_eq!(sweep.actions_total, 0);
    assert_eq!(store.deliveries().len(), 1);
}

#[tokio::test]
async fn test_created_execution_processes_to_completion() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Sms, "Hi {{first_name}}, {{property_title}} fits you");
    store.add_template(template.clone());
    store.add_snapshot(fixtures::snapshot(1));

    let workflow = fixtures::workflow(
        TriggerKind::LeadCreated,
        vec![ActionTemplate::send_message(Channel::Sms, template.id)],
    );
    store.add_workflow(workflow.clone());

    let (engine, _pool) = build_engine(&store, Arc::new(StaticEvaluator(true)), sender.clone());

    let outcome = engine
        .execute_workflow(workflow.id, 1, Trigger::lead_created(1, None, None), false)
        .await
        .unwrap();
    let ExecutionOutcome::Created { execution_id, .. } = outcome else {
        panic!("expected created outcome");
    };

    let completed = {
        let store = store.clone();
        wait_until(move || {
            store
                .execution(execution_id)
                .map(|e| e.status == ExecutionStatus::Completed)
                .unwrap_or(false)
        })
        .await
    };
    assert!(completed, "execution did not complete");

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "Hi Asha, Lakeview Residences fits you");
}

// ============================================
// Dispatcher handlers
// ============================================

#[tokio::test]
async fn test_missing_recipient_is_failed_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Sms, "hello");
    store.add_template(template.clone());

    let mut execution = fixtures::execution(Uuid::new_v4(), 1);
    execution.lead_snapshot.phone = None;
    let action = fixtures::action(execution.id, 0, fixtures::send_sms(template.id), Utc::now());
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, sender.clone());
    let stored = store.action(action.id).unwrap();
    let outcome = dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    assert!(matches!(outcome, ActionOutcome::Failed(_)));
    let failed = store.action(action.id).unwrap();
    assert_eq!(failed.status, ActionStatus::Failed);
    assert!(failed.error_message.unwrap().contains("no phone"));
    assert!(sender.sent().is_empty());
}

#[tokio::test]
async fn test_missing_template_is_failed() {
    let store = Arc::new(MemoryStore::new());
    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let action = fixtures::action(execution.id, 0, fixtures::send_sms(Uuid::new_v4()), Utc::now());
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, Arc::new(RecordingSender::new()));
    let stored = store.action(action.id).unwrap();
    let outcome = dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    assert!(matches!(outcome, ActionOutcome::Failed(_)));
}

#[tokio::test]
async fn test_send_records_delivery_and_external_id() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordingSender::new());
    let template = fixtures::message_template(Channel::Email, "Dear {{lead_name}}");
    store.add_template(template.clone());

    let execution = fixtures::execution(Uuid::new_v4(), 1);
    let action = fixtures::action(
        execution.id,
        0,
        ActionKind::SendMessage {
            channel: Channel::Email,
            message_template_id: template.id,
        },
        Utc::now(),
    );
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, sender.clone());
    let stored = store.action(action.id).unwrap();
    let outcome = dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    assert!(matches!(outcome, ActionOutcome::Completed(_)));

    let deliveries = store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].channel, "email");
    assert_eq!(deliveries[0].body, "Dear Asha Venkatesan");
    assert_eq!(deliveries[0].subject.as_deref(), Some("About Lakeview Residences"));

    let completed = store.action(action.id).unwrap();
    assert_eq!(
        completed.external_message_id,
        deliveries[0].provider_message_id
    );
}

#[tokio::test]
async fn test_update_lead_rejects_unwritable_field() {
    let store = Arc::new(MemoryStore::new());
    let execution = fixtures::execution(Uuid::new_v4(), 1);

    let mut updates = serde_json::Map::new();
    updates.insert("email".to_string(), json!("intruder@example.com"));
    let action = fixtures::action(
        execution.id,
        0,
        ActionKind::UpdateLead { updates },
        Utc::now(),
    );
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, Arc::new(RecordingSender::new()));
    let stored = store.action(action.id).unwrap();
    let outcome = dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    assert!(matches!(outcome, ActionOutcome::Failed(_)));
    assert!(store.lead_updates().is_empty());
}

#[tokio::test]
async fn test_update_lead_applies_field_map() {
    let store = Arc::new(MemoryStore::new());
    let execution = fixtures::execution(Uuid::new_v4(), 7);

    let mut updates = serde_json::Map::new();
    updates.insert("priority_tier".to_string(), json!("hot"));
    updates.insert("status".to_string(), json!("engaged"));
    let action = fixtures::action(
        execution.id,
        0,
        ActionKind::UpdateLead { updates: updates.clone() },
        Utc::now(),
    );
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, Arc::new(RecordingSender::new()));
    let stored = store.action(action.id).unwrap();
    let outcome = dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    assert!(matches!(outcome, ActionOutcome::Completed(_)));
    let applied = store.lead_updates();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].0, 7);
    assert_eq!(applied[0].1, updates);
}

#[tokio::test]
async fn test_create_task_renders_against_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let execution = fixtures::execution(Uuid::new_v4(), 3);
    let action = fixtures::action(
        execution.id,
        0,
        ActionKind::CreateTask {
            title: "Call {{first_name}} about {{property_title}}".to_string(),
            description: None,
            priority: "high".to_string(),
            due_in_days: 2,
        },
        Utc::now(),
    );
    store.create_execution(&execution, &[action.clone()]).await.unwrap();

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let dispatcher = ActionDispatcher::new(store_dyn, Arc::new(RecordingSender::new()));
    let stored = store.action(action.id).unwrap();
    dispatcher
        .execute(&stored, &execution.lead_snapshot)
        .await
        .unwrap();

    let tasks = store.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Call Asha about Lakeview Residences");
    assert_eq!(tasks[0].lead_id, 3);
    assert_eq!(tasks[0].priority, "high");
}

// ============================================
// Stats
// ============================================

#[tokio::test]
async fn test_workflow_stats_success_rate() {
    let store = Arc::new(MemoryStore::new());
    let workflow = fixtures::workflow(TriggerKind::Manual, vec![]);
    store.add_workflow(workflow.clone());

    for status in [
        ExecutionStatus::Completed,
        ExecutionStatus::Completed,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
    ] {
        let mut execution = fixtures::execution(workflow.id, 1);
        execution.status = status;
        store.create_execution(&execution, &[]).await.unwrap();
    }

    let (engine, _pool) = build_engine(
        &store,
        Arc::new(StaticEvaluator(true)),
        Arc::new(RecordingSender::new()),
    );

    let stats = engine.workflow_stats(workflow.id).await.unwrap();
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 1);
    assert!((stats.success_rate_pct - 75.0).abs() < f64::EPSILON);
}
