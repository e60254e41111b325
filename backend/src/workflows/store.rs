// Workflow Store - Durable instance and step state
//
// Every status change goes through a conditional update ("only if the
// current status is X") so that the sweep and an external approval can race
// on the same step without both winning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_shared::{
    ApprovalDecision, InstanceStatus, InstanceSummary, StepKindName, StepRecord, StepStatus,
    WorkflowInstance, WorkflowStats,
};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub workflow_id: String,
    pub event_type: String,
    pub trigger_payload: Value,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewStepRecord {
    pub instance_id: Uuid,
    pub step_index: i32,
    pub name: String,
    pub kind: StepKindName,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_instance(&self, instance: NewWorkflowInstance, now: DateTime<Utc>) -> StoreResult<WorkflowInstance>;

    async fn get_instance(&self, instance_id: Uuid) -> StoreResult<Option<WorkflowInstance>>;

    /// Move an instance out of `expected`. Returns false if it was no longer in that status.
    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        expected: InstanceStatus,
        new_status: InstanceStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Create the `pending` record for a step. Returns `None` when a record for
    /// `(instance_id, step_index)` already exists.
    async fn insert_step(&self, step: NewStepRecord, now: DateTime<Utc>) -> StoreResult<Option<StepRecord>>;

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>>;

    async fn list_steps(&self, instance_id: Uuid) -> StoreResult<Vec<StepRecord>>;

    /// Conditional transition. `at` becomes `scheduled_at` for `Scheduled` and
    /// `completed_at` for `Completed`/`TimedOut`; moving to `Pending` clears
    /// both. Returns false if the step was not in `expected`.
    async fn update_step_status(
        &self,
        step_id: Uuid,
        expected: StepStatus,
        new_status: StepStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Link the approval task and deadline of a pending approval step.
    async fn attach_approval(
        &self,
        step_id: Uuid,
        related_task_id: Option<Uuid>,
        timeout_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Complete a `pending` approval and store its decision in one write.
    /// Returns false if the step was no longer pending.
    async fn complete_approval(&self, step_id: Uuid, decision: ApprovalDecision, at: DateTime<Utc>) -> StoreResult<bool>;

    /// `scheduled` steps of running instances whose `scheduled_at <= now`, oldest first.
    async fn due_scheduled_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>>;

    /// `pending` steps of running instances whose `timeout_at <= now`, oldest deadline first.
    async fn timed_out_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>>;

    /// Latest step of each running instance when that step is `completed` and
    /// finished at or before `completed_before`. Such an instance was never
    /// advanced past it.
    async fn stalled_steps(&self, completed_before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>>;

    async fn list_instances(&self, limit: i64, offset: i64) -> StoreResult<Vec<InstanceSummary>>;

    async fn stats(&self) -> StoreResult<WorkflowStats>;
}

const STEP_COLUMNS: &str = "id, instance_id, step_index, name, kind, status, scheduled_at, timeout_at, \
                            related_task_id, decision, created_at, completed_at";

const JOINED_STEP_COLUMNS: &str = "ws.id, ws.instance_id, ws.step_index, ws.name, ws.kind, ws.status, \
                                   ws.scheduled_at, ws.timeout_at, ws.related_task_id, ws.decision, \
                                   ws.created_at, ws.completed_at";

#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    db_pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn insert_instance(&self, instance: NewWorkflowInstance, now: DateTime<Utc>) -> StoreResult<WorkflowInstance> {
        let row = sqlx::query_as::<_, WorkflowInstance>(
            r#"
            INSERT INTO workflow_instances
            (id, workflow_id, event_type, trigger_payload, status, created_by, created_at)
            VALUES ($1, $2, $3, $4, 'running', $5, $6)
            RETURNING id, workflow_id, event_type, trigger_payload, status, created_by,
                      error_message, created_at, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&instance.workflow_id)
        .bind(&instance.event_type)
        .bind(&instance.trigger_payload)
        .bind(instance.created_by)
        .bind(now)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(row)
    }

    async fn get_instance(&self, instance_id: Uuid) -> StoreResult<Option<WorkflowInstance>> {
        let row = sqlx::query_as::<_, WorkflowInstance>(
            r#"
            SELECT id, workflow_id, event_type, trigger_payload, status, created_by,
                   error_message, created_at, completed_at
            FROM workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row)
    }

    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        expected: InstanceStatus,
        new_status: InstanceStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let completed_at = new_status.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $3, error_message = COALESCE($4, error_message), completed_at = $5
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(instance_id)
        .bind(expected)
        .bind(new_status)
        .bind(error_message)
        .bind(completed_at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_step(&self, step: NewStepRecord, now: DateTime<Utc>) -> StoreResult<Option<StepRecord>> {
        let query = format!(
            r#"
            INSERT INTO workflow_steps (id, instance_id, step_index, name, kind, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            ON CONFLICT (instance_id, step_index) DO NOTHING
            RETURNING {STEP_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, StepRecord>(&query)
            .bind(Uuid::new_v4())
            .bind(step.instance_id)
            .bind(step.step_index)
            .bind(&step.name)
            .bind(step.kind)
            .bind(now)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(row)
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>> {
        let query = format!("SELECT {STEP_COLUMNS} FROM workflow_steps WHERE id = $1");

        let row = sqlx::query_as::<_, StepRecord>(&query)
            .bind(step_id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(row)
    }

    async fn list_steps(&self, instance_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let query = format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE instance_id = $1 ORDER BY step_index ASC"
        );

        let rows = sqlx::query_as::<_, StepRecord>(&query)
            .bind(instance_id)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows)
    }

    async fn update_step_status(
        &self,
        step_id: Uuid,
        expected: StepStatus,
        new_status: StepStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let assignments = match new_status {
            StepStatus::Scheduled => "scheduled_at = $4",
            StepStatus::Pending => "scheduled_at = NULL, completed_at = NULL",
            StepStatus::Completed | StepStatus::TimedOut => "scheduled_at = NULL, completed_at = $4",
        };

        let query = format!(
            "UPDATE workflow_steps SET status = $3, {assignments} WHERE id = $1 AND status = $2"
        );

        let mut statement = sqlx::query(&query).bind(step_id).bind(expected).bind(new_status);
        if new_status != StepStatus::Pending {
            statement = statement.bind(at);
        }

        let result = statement.execute(&self.db_pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn attach_approval(
        &self,
        step_id: Uuid,
        related_task_id: Option<Uuid>,
        timeout_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE workflow_steps SET related_task_id = $2, timeout_at = $3 WHERE id = $1")
            .bind(step_id)
            .bind(related_task_id)
            .bind(timeout_at)
            .execute(&self.db_pool)
            .await?;

        Ok(())
    }

    async fn complete_approval(&self, step_id: Uuid, decision: ApprovalDecision, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'completed', decision = $2, completed_at = $3
            WHERE id = $1 AND status = 'pending' AND kind = 'approval'
            "#,
        )
        .bind(step_id)
        .bind(decision)
        .bind(at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_scheduled_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        let query = format!(
            r#"
            SELECT {JOINED_STEP_COLUMNS} FROM workflow_steps ws
            INNER JOIN workflow_instances wi ON wi.id = ws.instance_id
            WHERE ws.status = 'scheduled' AND ws.scheduled_at <= $1 AND wi.status = 'running'
            ORDER BY ws.scheduled_at ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, StepRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows)
    }

    async fn timed_out_steps(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        let query = format!(
            r#"
            SELECT {JOINED_STEP_COLUMNS} FROM workflow_steps ws
            INNER JOIN workflow_instances wi ON wi.id = ws.instance_id
            WHERE ws.status = 'pending' AND ws.timeout_at <= $1 AND wi.status = 'running'
            ORDER BY ws.timeout_at ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, StepRecord>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows)
    }

    async fn stalled_steps(&self, completed_before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<StepRecord>> {
        let query = format!(
            r#"
            SELECT {JOINED_STEP_COLUMNS} FROM workflow_steps ws
            INNER JOIN workflow_instances wi ON wi.id = ws.instance_id
            WHERE ws.status = 'completed' AND ws.completed_at <= $1 AND wi.status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_steps later
                  WHERE later.instance_id = ws.instance_id AND later.step_index > ws.step_index
              )
            ORDER BY ws.completed_at ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, StepRecord>(&query)
            .bind(completed_before)
            .bind(limit)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(rows)
    }

    async fn list_instances(&self, limit: i64, offset: i64) -> StoreResult<Vec<InstanceSummary>> {
        let rows = sqlx::query_as::<_, InstanceSummary>(
            r#"
            SELECT wi.id, wi.workflow_id, wi.event_type, wi.trigger_payload, wi.status, wi.created_by,
                   wi.error_message, wi.created_at, wi.completed_at,
                   COUNT(ws.id) AS total_steps,
                   COUNT(ws.id) FILTER (WHERE ws.status = 'completed') AS completed_steps
            FROM workflow_instances wi
            LEFT JOIN workflow_steps ws ON wi.id = ws.instance_id
            GROUP BY wi.id
            ORDER BY wi.created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows)
    }

    async fn stats(&self) -> StoreResult<WorkflowStats> {
        let stats = sqlx::query_as::<_, WorkflowStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM workflow_instances) AS total_instances,
                (SELECT COUNT(*) FROM workflow_instances WHERE status = 'running') AS running_instances,
                (SELECT COUNT(*) FROM workflow_instances WHERE status = 'completed') AS completed_instances,
                (SELECT COUNT(*) FROM workflow_instances WHERE status = 'failed') AS failed_instances,
                COUNT(*) AS total_steps,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_steps,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending_steps,
                COUNT(*) FILTER (WHERE status = 'scheduled') AS scheduled_steps,
                COUNT(*) FILTER (WHERE status = 'timed_out') AS timed_out_steps
            FROM workflow_steps
            "#,
        )
        .fetch_one(&self.db_pool)
        .await?;

        Ok(stats)
    }
}
