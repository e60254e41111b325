// Workflow Catalog - Definitions loaded once at startup

use ledgerflow_shared::{StepKindName, TaskPriority};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::actions::ActionKind;
use super::triggers::event_types;
use super::Condition;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read workflow catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Workflow catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid workflow definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },
    #[error("Duplicate workflow definition id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Event type this definition reacts to
    pub trigger: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Approval(ApprovalConfig),
    Action(ActionConfig),
    Delay(DelayConfig),
}

impl StepKind {
    pub fn name(&self) -> StepKindName {
        match self {
            Self::Approval(_) => StepKindName::Approval,
            Self::Action(_) => StepKindName::Action,
            Self::Delay(_) => StepKindName::Delay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Role whose most recently active holder receives the approval task
    pub assignee_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<u32>,
    /// Task title template; `{{path}}` placeholders are filled from the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub action: String,
    /// When non-zero the side effect runs on the sweep after this many days
    #[serde(default)]
    pub delay_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_priority: Option<TaskPriority>,
    /// Step-level guard; when it does not hold the side effect is skipped
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Overrides the engine-wide failure policy for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<FailurePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    pub delay_days: u32,
}

/// What happens to the instance when an action's side effect fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure, complete the step and keep going
    #[default]
    FailOpen,
    /// Mark the instance failed and stop
    FailClosed,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fail_open" => Ok(Self::FailOpen),
            "fail_closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

impl WorkflowDefinition {
    fn validate(&mut self) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidDefinition {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.trigger.trim().is_empty() {
            return Err(invalid("trigger must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("a workflow needs at least one step".to_string()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(invalid(format!("step {} has no name", index)));
            }

            match &step.kind {
                StepKind::Approval(config) if config.assignee_role.trim().is_empty() => {
                    return Err(invalid(format!("approval step '{}' has no assignee_role", step.name)));
                }
                StepKind::Action(config) if ActionKind::from_name(&config.action).is_none() => {
                    // Runs as a no-op; see ActionExecutor
                    warn!(
                        workflow = %self.id,
                        step = %step.name,
                        action = %config.action,
                        "Workflow step references an unknown action"
                    );
                }
                _ => {}
            }
        }

        if !event_types::is_known(&self.trigger) {
            warn!(workflow = %self.id, trigger = %self.trigger, "Workflow listens for an unrecognised event type");
        }

        if self.name.trim().is_empty() {
            self.name = self.id.clone();
        }

        Ok(())
    }
}

/// Read-only registry of workflow definitions, indexed by trigger.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    definitions: Vec<Arc<WorkflowDefinition>>,
    by_trigger: HashMap<String, Vec<Arc<WorkflowDefinition>>>,
    by_id: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    /// Build a catalog, rejecting the whole set if any definition is malformed.
    pub fn new(definitions: Vec<WorkflowDefinition>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        let mut seen = HashSet::new();

        for mut definition in definitions {
            definition.validate()?;

            if !seen.insert(definition.id.clone()) {
                return Err(CatalogError::DuplicateId(definition.id));
            }

            let definition = Arc::new(definition);
            catalog
                .by_trigger
                .entry(definition.trigger.clone())
                .or_default()
                .push(definition.clone());
            catalog.by_id.insert(definition.id.clone(), definition.clone());
            catalog.definitions.push(definition);
        }

        Ok(catalog)
    }

    /// Parse a JSON array of definitions.
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let entries: Vec<Value> = serde_json::from_str(raw)?;
        Self::from_values(entries)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let catalog = Self::from_json_str(&raw)?;
        info!("Loaded {} workflow definitions from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    fn from_values(entries: Vec<Value>) -> Result<Self, CatalogError> {
        let mut definitions = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));

            let definition: WorkflowDefinition = serde_json::from_value(entry)
                .map_err(|e| CatalogError::InvalidDefinition { id, reason: e.to_string() })?;
            definitions.push(definition);
        }

        Self::new(definitions)
    }

    /// The definitions shipped with the ledger when no catalog file is configured.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_values(vec![
            json!({
                "id": "invoice_approval",
                "name": "Invoice Approval Workflow",
                "description": "Multi-step approval process for invoices over threshold",
                "trigger": event_types::INVOICE_CREATED,
                "conditions": [
                    {"field": "total_amount", "operator": ">", "value": 50000}
                ],
                "steps": [
                    {"name": "Admin Approval", "type": "approval", "assignee_role": "admin", "timeout_hours": 24},
                    {"name": "Admin Review", "type": "approval", "assignee_role": "admin", "timeout_hours": 48}
                ]
            }),
            json!({
                "id": "bill_payment",
                "name": "Bill Payment Workflow",
                "description": "Automated bill payment processing",
                "trigger": event_types::BILL_APPROVED,
                "steps": [
                    {
                        "name": "Schedule Payment",
                        "type": "action",
                        "action": "schedule_payment",
                        "conditions": [
                            {"field": "payment_terms", "operator": "==", "value": "Net 30"}
                        ]
                    }
                ]
            }),
            json!({
                "id": "overdue_invoice",
                "name": "Overdue Invoice Management",
                "description": "Automated handling of overdue invoices",
                "trigger": event_types::INVOICE_OVERDUE,
                "steps": [
                    {
                        "name": "Escalate to Collections",
                        "type": "action",
                        "action": "create_task",
                        "delay_days": 7,
                        "assignee_role": "admin",
                        "task_title": "Follow up on overdue invoice {{invoice_number}}",
                        "task_priority": "high"
                    }
                ]
            }),
            json!({
                "id": "budget_alert",
                "name": "Budget Alert System",
                "description": "Alerts when budget thresholds are exceeded",
                "trigger": event_types::TRANSACTION_POSTED,
                "conditions": [
                    {"field": "budget_exceeded", "operator": "==", "value": true}
                ],
                "steps": [
                    {"name": "Freeze Transactions", "type": "action", "action": "require_approval"}
                ]
            }),
            json!({
                "id": "new_customer_onboarding",
                "name": "Customer Onboarding",
                "description": "Automated customer welcome and setup process",
                "trigger": event_types::CUSTOMER_CREATED,
                "steps": [
                    {
                        "name": "Create Credit Application",
                        "type": "action",
                        "action": "create_task",
                        "assignee_role": "admin",
                        "task_title": "Review credit application for {{customer_name}}",
                        "task_priority": "medium"
                    },
                    {
                        "name": "Setup Customer Portal",
                        "type": "action",
                        "action": "send_portal_invite",
                        "delay_days": 1
                    }
                ]
            }),
        ])
    }

    /// Every definition reacting to `event_type`, in catalog order.
    pub fn match_event(&self, event_type: &str) -> &[Arc<WorkflowDefinition>] {
        self.by_trigger
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.by_id.get(id).cloned()
    }

    pub fn definitions(&self) -> &[Arc<WorkflowDefinition>] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
