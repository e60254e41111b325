// Workflow Automation Engine
//
// Reacts to ledger events, filters them through declarative conditions and
// drives approval, action and delay steps to completion. Suspended steps live
// in the workflow store and are picked up again by the scheduler sweep.

pub mod actions;
pub mod catalog;
pub mod clock;
pub mod conditions;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memory_store;
pub mod services;
pub mod store;
pub mod sweep;
pub mod triggers;

pub use actions::{ActionKind, ActionResult};
pub use catalog::{
    ActionConfig, ApprovalConfig, CatalogError, DelayConfig, FailurePolicy, StepDefinition, StepKind,
    WorkflowCatalog, WorkflowDefinition,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{Condition, ConditionOperator};
pub use engine::{Collaborators, DispatchReport, EngineConfig, WorkflowEngine};
pub use error::{ExecutorError, WorkflowError, WorkflowResult};
pub use executor::{ExecutionContext, StepExecutor, StepOutcome, WorkflowExecutor};
pub use memory_store::MemoryWorkflowStore;
pub use services::{
    ActionRequest, BusinessActions, LoggingBusinessActions, NewTask, PgRoleDirectory, PgTaskService,
    RoleDirectory, ServiceError, ServiceResult, TaskService,
};
pub use store::{PgWorkflowStore, StoreError, WorkflowStore};
pub use sweep::{STALL_GRACE_MINUTES, SchedulerSweep, SweepReport};
pub use triggers::{EventPayload, EventSource, TriggerEvent};
