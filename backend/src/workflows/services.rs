// Workflow Services - Collaborators the engine calls out to
//
// Tasks, role lookups and ledger side effects are owned by other modules;
// the engine only sees these narrow traits.

use async_trait::async_trait;
use ledgerflow_shared::{TaskCategory, TaskPriority, WorkflowInstance};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{service} failed: {message}")]
    External { service: String, message: String },
}

impl ServiceError {
    pub fn external(service: &str, message: impl Into<String>) -> Self {
        Self::External {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Task handed to the task subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub assignee_id: Option<Uuid>,
    pub category: TaskCategory,
    /// Acting user recorded as the task's creator
    pub created_by: Option<Uuid>,
    pub workflow_instance_id: Option<Uuid>,
}

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, task: NewTask) -> ServiceResult<Uuid>;
}

#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Most recently active user holding `role`, if any.
    async fn find_active_user_by_role(&self, role: &str) -> ServiceResult<Option<Uuid>>;
}

/// Context passed to a ledger side effect
#[derive(Debug, Clone, Copy)]
pub struct ActionRequest<'a> {
    pub instance: &'a WorkflowInstance,
    pub step_name: &'a str,
    pub acting_user_id: Option<Uuid>,
}

impl ActionRequest<'_> {
    pub fn payload(&self) -> &Value {
        &self.instance.trigger_payload
    }
}

/// Ledger, billing and portal side effects reachable from action steps
#[async_trait]
pub trait BusinessActions: Send + Sync {
    async fn schedule_payment(&self, request: &ActionRequest<'_>) -> ServiceResult<Value>;
    async fn send_portal_invite(&self, request: &ActionRequest<'_>) -> ServiceResult<Value>;
    /// Freeze further postings until someone approves them
    async fn require_approval(&self, request: &ActionRequest<'_>) -> ServiceResult<Value>;
}

/// Records side effects in the log only. Used until billing wires in real handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBusinessActions;

#[async_trait]
impl BusinessActions for LoggingBusinessActions {
    async fn schedule_payment(&self, request: &ActionRequest<'_>) -> ServiceResult<Value> {
        info!(instance_id = %request.instance.id, step = request.step_name, "Payment scheduled");
        Ok(serde_json::json!({ "scheduled": true }))
    }

    async fn send_portal_invite(&self, request: &ActionRequest<'_>) -> ServiceResult<Value> {
        info!(instance_id = %request.instance.id, step = request.step_name, "Portal invite sent");
        Ok(serde_json::json!({ "invited": true }))
    }

    async fn require_approval(&self, request: &ActionRequest<'_>) -> ServiceResult<Value> {
        info!(instance_id = %request.instance.id, step = request.step_name, "Approval required");
        Ok(serde_json::json!({ "frozen": true }))
    }
}

/// Writes tasks straight into the `tasks` table
#[derive(Debug, Clone)]
pub struct PgTaskService {
    db_pool: PgPool,
}

impl PgTaskService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TaskService for PgTaskService {
    async fn create_task(&self, task: NewTask) -> ServiceResult<Uuid> {
        let task_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO tasks
            (id, title, description, priority, status, assigned_to, created_by, category, workflow_instance_id, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(task_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.priority.as_str())
        .bind(task.assignee_id)
        .bind(task.created_by)
        .bind(task.category.as_str())
        .bind(task.workflow_instance_id)
        .execute(&self.db_pool)
        .await?;

        Ok(task_id)
    }
}

/// Role lookup over the RBAC tables, falling back to the legacy `users.role` column
#[derive(Debug, Clone)]
pub struct PgRoleDirectory {
    db_pool: PgPool,
}

impl PgRoleDirectory {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl RoleDirectory for PgRoleDirectory {
    async fn find_active_user_by_role(&self, role: &str) -> ServiceResult<Option<Uuid>> {
        let assigned: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT u.id FROM users u
            INNER JOIN user_roles ur ON u.id = ur.user_id
            INNER JOIN roles r ON ur.role_id = r.id
            WHERE r.name = $1 AND u.status = 'active'
            ORDER BY u.last_login DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(role)
        .fetch_optional(&self.db_pool)
        .await?;

        if assigned.is_some() {
            return Ok(assigned);
        }

        let legacy: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM users
            WHERE role = $1 AND status = 'active'
            ORDER BY last_login DESC NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(role)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(legacy)
    }
}
