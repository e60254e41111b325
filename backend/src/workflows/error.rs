// Workflow Errors

use thiserror::Error;
use uuid::Uuid;

use super::catalog::CatalogError;
use super::services::ServiceError;
use super::store::StoreError;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Workflow step not found: {0}")]
    StepNotFound(Uuid),
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("Workflow step {0} is not an approval step")]
    NotAnApproval(Uuid),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Raised by a step executor.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The step's configuration cannot be executed; the instance fails.
    #[error("Invalid step configuration: {0}")]
    InvalidConfig(String),
    /// The side effect failed; the step's failure policy decides what happens next.
    #[error("Action '{action}' failed: {source}")]
    Action {
        action: String,
        #[source]
        source: ServiceError,
    },
}
