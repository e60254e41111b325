mod common;

use chrono::Duration;
use common::{TestHarness, catalog, invoice_payload, start_of_day};
use ledgerflow_backend::jobs::{JobConfig, JobError, JobScheduler, JobStatus, WorkflowSweepJob};
use ledgerflow_backend::workflows::store::{NewStepRecord, NewWorkflowInstance, WorkflowStore};
use ledgerflow_backend::workflows::{
    EngineConfig, STALL_GRACE_MINUTES, SchedulerSweep, TriggerEvent, WorkflowCatalog,
    WorkflowError,
};
use ledgerflow_shared::{
    ApprovalDecision, InstanceStatus, StepKindName, StepStatus, TaskCategory, TaskPriority,
};
use serde_json::json;
use uuid::Uuid;

fn expiring_approval() -> WorkflowCatalog {
    catalog(json!([{
        "id": "same_day_approval",
        "trigger": "invoice.created",
        "steps": [
            {"name": "Sign Off", "type": "approval", "assignee_role": "admin", "timeout_hours": 0},
            {"name": "Pay", "type": "action", "action": "schedule_payment"}
        ]
    }]))
}

fn delay_then_payment() -> WorkflowCatalog {
    catalog(json!([{
        "id": "cooling_off",
        "trigger": "bill.approved",
        "steps": [
            {"name": "Cooling Off", "type": "delay", "delay_days": 1},
            {"name": "Pay", "type": "action", "action": "schedule_payment"}
        ]
    }]))
}

#[tokio::test]
async fn test_expired_approval_is_escalated_and_instance_keeps_running() {
    let harness = TestHarness::new(expiring_approval());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();
    let instance_id = report.instances[0];
    let approval = harness.steps(instance_id).await.remove(0);

    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.escalated, 1);
    assert!(report.is_clean());

    let steps = harness.steps(instance_id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::TimedOut);
    assert_eq!(harness.instance(instance_id).await.status, InstanceStatus::Running);

    let tasks = harness.tasks.created();
    assert_eq!(tasks.len(), 2);
    let (_, escalation) = &tasks[1];
    assert_eq!(escalation.title, "Workflow Step Timed Out: Sign Off");
    assert_eq!(escalation.priority, TaskPriority::Urgent);
    assert_eq!(escalation.category, TaskCategory::Escalation);
    assert_eq!(escalation.assignee_id, Some(harness.admin_id));
    assert_eq!(escalation.workflow_instance_id, Some(instance_id));
    assert!(escalation.description.contains(&tasks[0].0.to_string()));

    // A decision arriving after the deadline does nothing
    let applied = harness
        .engine
        .resolve_approval(approval.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(harness.steps(instance_id).await.len(), 1);
    assert_eq!(harness.actions.count("schedule_payment"), 0);

    // Escalation happens once
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.escalated, 0);
    assert_eq!(harness.tasks.created().len(), 2);
}

#[tokio::test]
async fn test_approval_is_not_escalated_before_its_deadline() {
    let harness = TestHarness::new(catalog(json!([{
        "id": "day_long_approval",
        "trigger": "invoice.created",
        "steps": [{"name": "Sign Off", "type": "approval", "assignee_role": "admin", "timeout_hours": 24}]
    }])));
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();
    let instance_id = report.instances[0];

    harness.clock.advance(Duration::hours(23));
    assert_eq!(sweep.run_once().await.unwrap().escalated, 0);
    assert_eq!(harness.steps(instance_id).await[0].status, StepStatus::Pending);

    harness.clock.advance(Duration::hours(2));
    assert_eq!(sweep.run_once().await.unwrap().escalated, 1);
    assert_eq!(harness.steps(instance_id).await[0].status, StepStatus::TimedOut);
}

#[tokio::test]
async fn test_escalation_without_role_holder_is_unassigned() {
    let harness = TestHarness::without_roles(expiring_approval());

    harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();
    let report = SchedulerSweep::new(harness.engine.clone()).run_once().await.unwrap();

    assert_eq!(report.escalated, 1);
    let tasks = harness.tasks.created();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].1.category, TaskCategory::Escalation);
    assert_eq!(tasks[0].1.assignee_id, None);
}

#[tokio::test]
async fn test_delay_step_reschedules_then_advances() {
    let harness = TestHarness::new(delay_then_payment());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4(), "amount": "420.00"}))
        .await
        .unwrap();
    let instance_id = report.instances[0];

    let steps = harness.steps(instance_id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Scheduled);
    assert_eq!(steps[0].scheduled_at, Some(start_of_day() + Duration::days(1)));

    // Not due yet
    assert_eq!(sweep.run_once().await.unwrap().resumed, 0);
    assert_eq!(harness.actions.count("schedule_payment"), 0);

    harness.clock.advance(Duration::days(1) + Duration::minutes(1));
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.resumed, 1);

    let steps = harness.steps(instance_id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].scheduled_at, None);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(harness.instance(instance_id).await.status, InstanceStatus::Completed);
    assert_eq!(harness.actions.count("schedule_payment"), 1);

    // Claimed steps are never run twice
    assert_eq!(sweep.run_once().await.unwrap().resumed, 0);
    assert_eq!(harness.actions.count("schedule_payment"), 1);
}

#[tokio::test]
async fn test_delayed_action_runs_when_resumed() {
    let harness = TestHarness::new(WorkflowCatalog::builtin().unwrap());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let event = TriggerEvent::customer_created(Uuid::new_v4(), "Acme Holdings", "ap@acme.test", Uuid::new_v4());
    let report = harness.engine.dispatch_event(event).await.unwrap();
    let instance_id = report.instances[0];

    assert_eq!(harness.tasks.titles(), vec!["Review credit application for Acme Holdings"]);
    let steps = harness.steps(instance_id).await;
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Scheduled);
    assert_eq!(steps[1].kind, StepKindName::Action);
    assert_eq!(harness.actions.count("send_portal_invite"), 0);

    harness.clock.advance(Duration::days(2));
    assert_eq!(sweep.run_once().await.unwrap().resumed, 1);

    assert_eq!(harness.actions.count("send_portal_invite"), 1);
    assert_eq!(harness.instance(instance_id).await.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_instances_are_not_resumed() {
    let harness = TestHarness::new(delay_then_payment());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4()}))
        .await
        .unwrap();
    let instance_id = report.instances[0];
    harness.engine.cancel_instance(instance_id).await.unwrap();

    harness.clock.advance(Duration::days(3));
    let report = sweep.run_once().await.unwrap();

    assert_eq!(report.resumed, 0);
    assert_eq!(harness.steps(instance_id).await[0].status, StepStatus::Scheduled);
    assert_eq!(harness.actions.count("schedule_payment"), 0);
}

#[tokio::test]
async fn test_failing_rows_do_not_stop_the_batch() {
    let harness = TestHarness::new(catalog(json!([
        {
            "id": "same_day_approval",
            "trigger": "invoice.created",
            "steps": [{"name": "Sign Off", "type": "approval", "assignee_role": "admin", "timeout_hours": 0}]
        },
        {
            "id": "cooling_off",
            "trigger": "bill.approved",
            "steps": [
                {"name": "Cooling Off", "type": "delay", "delay_days": 1},
                {"name": "Pay", "type": "action", "action": "schedule_payment"}
            ]
        }
    ])));

    harness.engine.dispatch("invoice.created", invoice_payload(10)).await.unwrap();
    let report = harness
        .engine
        .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4()}))
        .await
        .unwrap();
    let delayed_instance = report.instances[0];

    // An instance whose definition has since been removed from the catalog
    let orphan = harness
        .store
        .insert_instance(
            NewWorkflowInstance {
                workflow_id: "retired_workflow".to_string(),
                event_type: "bill.approved".to_string(),
                trigger_payload: json!({}),
                created_by: None,
            },
            start_of_day(),
        )
        .await
        .unwrap();
    let orphan_step = harness
        .store
        .insert_step(
            NewStepRecord {
                instance_id: orphan.id,
                step_index: 0,
                name: "Wait".to_string(),
                kind: StepKindName::Delay,
            },
            start_of_day(),
        )
        .await
        .unwrap()
        .unwrap();
    harness
        .store
        .update_step_status(orphan_step.id, StepStatus::Pending, StepStatus::Scheduled, start_of_day())
        .await
        .unwrap();

    // Escalation tasks cannot be created this tick
    harness.tasks.set_failing(true);
    harness.clock.advance(Duration::days(2));

    let report = SchedulerSweep::new(harness.engine.clone()).run_once().await.unwrap();

    assert_eq!(report.resumed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(!report.is_clean());

    assert_eq!(harness.instance(delayed_instance).await.status, InstanceStatus::Completed);
    let orphan = harness.instance(orphan.id).await;
    assert_eq!(orphan.status, InstanceStatus::Failed);
    assert!(orphan.error_message.unwrap().contains("retired_workflow"));
}

#[tokio::test]
async fn test_failed_escalation_is_retried_next_tick() {
    let harness = TestHarness::new(expiring_approval());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();
    let instance_id = report.instances[0];

    harness.tasks.set_failing(true);
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.escalated, 0);
    assert_eq!(report.errors.len(), 1);

    let step = harness.steps(instance_id).await.remove(0);
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.completed_at, None);

    harness.tasks.set_failing(false);
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.escalated, 1);
    assert!(report.is_clean());
    assert_eq!(harness.steps(instance_id).await[0].status, StepStatus::TimedOut);

    let escalations = harness
        .tasks
        .created()
        .into_iter()
        .filter(|(_, task)| task.category == TaskCategory::Escalation)
        .count();
    assert_eq!(escalations, 1);
}

#[tokio::test]
async fn test_claimed_step_is_released_when_resume_fails() {
    let harness = TestHarness::new(delay_then_payment());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4()}))
        .await
        .unwrap();
    let instance_id = report.instances[0];
    harness.clock.advance(Duration::days(2));

    // The claim succeeds; completing the claimed step does not
    harness.faults.fail_nth("update_step_status", 2);
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(report.errors.len(), 1);

    let step = harness.steps(instance_id).await.remove(0);
    assert_eq!(step.status, StepStatus::Scheduled);
    assert_eq!(step.scheduled_at, Some(start_of_day() + Duration::days(2)));

    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(harness.instance(instance_id).await.status, InstanceStatus::Completed);
    assert_eq!(harness.actions.count("schedule_payment"), 1);
}

#[tokio::test]
async fn test_instance_stalled_after_approval_is_advanced() {
    let harness = TestHarness::new(expiring_approval());
    let sweep = SchedulerSweep::new(harness.engine.clone());

    let report = harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();
    let instance_id = report.instances[0];
    let step_id = harness.steps(instance_id).await[0].id;

    harness.faults.fail_next("insert_step");
    assert!(harness.engine.resolve_approval(step_id, ApprovalDecision::Approve).await.is_err());

    // Inside the grace period an in-flight advance is left alone
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.escalated, 0);
    assert_eq!(harness.steps(instance_id).await.len(), 1);

    harness.clock.advance(Duration::minutes(STALL_GRACE_MINUTES + 1));
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert!(report.is_clean());

    let steps = harness.steps(instance_id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].decision, Some(ApprovalDecision::Approve));
    assert_eq!(harness.instance(instance_id).await.status, InstanceStatus::Completed);
    assert_eq!(harness.actions.count("schedule_payment"), 1);

    assert_eq!(sweep.run_once().await.unwrap().recovered, 0);
    assert_eq!(harness.actions.count("schedule_payment"), 1);
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let config = EngineConfig {
        sweep_batch_size: 1,
        ..EngineConfig::default()
    };
    let harness = TestHarness::with_config(delay_then_payment(), config);
    let sweep = SchedulerSweep::new(harness.engine.clone());

    for _ in 0..2 {
        harness
            .engine
            .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4()}))
            .await
            .unwrap();
    }
    harness.clock.advance(Duration::days(2));

    assert_eq!(sweep.run_once().await.unwrap().resumed, 1);
    assert_eq!(sweep.run_once().await.unwrap().resumed, 1);
    assert_eq!(sweep.run_once().await.unwrap().resumed, 0);
    assert_eq!(harness.actions.count("schedule_payment"), 2);
}

#[tokio::test]
async fn test_sweep_fails_when_store_is_unreachable() {
    let harness = TestHarness::new(delay_then_payment());
    harness.store.set_unavailable(Some("connection reset")).await;

    let result = SchedulerSweep::new(harness.engine.clone()).run_once().await;
    assert!(matches!(result, Err(WorkflowError::Store(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sweep_job_and_manual_run() {
    let harness = TestHarness::new(delay_then_payment());
    harness
        .engine
        .dispatch("bill.approved", json!({"bill_id": Uuid::new_v4()}))
        .await
        .unwrap();
    harness.clock.advance(Duration::days(2));

    let job = WorkflowSweepJob::new(harness.engine.clone());
    let report = job.run().await.unwrap().unwrap();
    assert_eq!(report.resumed, 1);

    let scheduler = JobScheduler::new(
        harness.engine.clone(),
        JobConfig {
            workflow_sweep_enabled: false,
            ..JobConfig::default()
        },
    )
    .await
    .unwrap();

    scheduler.run_job_now(WorkflowSweepJob::NAME).await.unwrap();
    let logs = scheduler.get_execution_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].job_name, WorkflowSweepJob::NAME);
    assert_eq!(logs[0].status, JobStatus::Completed);
    assert_eq!(logs[0].items_processed, 0);

    assert!(scheduler.run_job_now("nightly_backup").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_run_does_not_overlap_a_running_sweep() {
    let harness = TestHarness::new(expiring_approval());
    harness
        .engine
        .dispatch("invoice.created", invoice_payload(5000))
        .await
        .unwrap();

    let scheduler = JobScheduler::new(
        harness.engine.clone(),
        JobConfig {
            workflow_sweep_enabled: false,
            ..JobConfig::default()
        },
    )
    .await
    .unwrap();

    // Park the sweep inside escalation task creation
    let gate = harness.tasks.hold().await;
    let job = scheduler.sweep_job();
    let tick = tokio::spawn({
        let job = job.clone();
        async move { job.run().await }
    });
    while !job.is_running() {
        tokio::task::yield_now().await;
    }

    let result = scheduler.run_job_now(WorkflowSweepJob::NAME).await;
    assert!(matches!(result, Err(JobError::AlreadyRunning(_))));
    assert!(scheduler.get_execution_logs().await.is_empty());

    drop(gate);
    let report = tick.await.unwrap().unwrap().unwrap();
    assert_eq!(report.escalated, 1);

    scheduler.run_job_now(WorkflowSweepJob::NAME).await.unwrap();
    assert_eq!(harness.tasks.created().len(), 2);
}
