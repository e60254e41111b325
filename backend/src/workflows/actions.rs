// Workflow Actions - Named side effects that action steps can run

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use super::conditions::resolve_field;

/// Actions an action step can name in its `action` field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SchedulePayment,
    CreateTask,
    SendPortalInvite,
    RequireApproval,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        Self::SchedulePayment,
        Self::CreateTask,
        Self::SendPortalInvite,
        Self::RequireApproval,
    ];

    /// Lookup by configured name; `None` for anything the engine does not know.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name.trim())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchedulePayment => "schedule_payment",
            Self::CreateTask => "create_task",
            Self::SendPortalInvite => "send_portal_invite",
            Self::RequireApproval => "require_approval",
        }
    }
}

/// Record of an action step's side effect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: String,
    pub skipped: bool,
    pub output: Option<Value>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(action: &str, output: Option<Value>) -> Self {
        Self {
            action: action.to_string(),
            skipped: false,
            output,
            duration_ms: 0,
        }
    }

    /// The side effect was deliberately not run (unknown action, unmet guard).
    pub fn skipped(action: &str, reason: &str) -> Self {
        Self {
            action: action.to_string(),
            skipped: true,
            output: Some(serde_json::json!({ "skipped": reason })),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^}\s]+)\s*\}\}").expect("placeholder pattern is valid"))
}

/// Replace `{{dotted.path}}` placeholders with values from the payload.
/// Unresolvable placeholders are left as written.
pub fn render_template(template: &str, payload: &Value) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures| match resolve_field(payload, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Human-readable task body listing the event data
pub fn describe_payload(payload: &Value) -> String {
    match payload {
        Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{}: {}", key, s),
                other => format!("{}: {}", key, other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) | Value::Null => "(no event data)".to_string(),
        other => other.to_string(),
    }
}
