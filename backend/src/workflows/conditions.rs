// Workflow Conditions - Predicates evaluated against event payloads

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;
use tracing::warn;

/// A single condition to evaluate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Dotted path into the event payload, e.g. `customer.tier`
    pub field: String,
    /// Operator for comparison, kept as written so that unknown operators
    /// surface at evaluation time rather than when the catalog loads
    pub operator: String,
    /// Value to compare against
    #[serde(default)]
    pub value: Value,
}

/// Condition operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEquals,
    LessThanOrEquals,
    Contains,
    In,
    NotIn,
}

impl ConditionOperator {
    pub fn parse(operator: &str) -> Option<Self> {
        match operator.trim() {
            "==" | "=" => Some(Self::Equals),
            "!=" | "<>" => Some(Self::NotEquals),
            ">" => Some(Self::GreaterThan),
            "<" => Some(Self::LessThan),
            ">=" => Some(Self::GreaterThanOrEquals),
            "<=" => Some(Self::LessThanOrEquals),
            "contains" => Some(Self::Contains),
            "in" => Some(Self::In),
            "not_in" => Some(Self::NotIn),
            _ => None,
        }
    }

    /// Whether a missing field satisfies this operator.
    fn matches_absent(&self) -> bool {
        matches!(self, Self::NotEquals | Self::NotIn)
    }
}

impl Condition {
    pub fn new(field: &str, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }
    }

    pub fn equals(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, "==", value)
    }

    pub fn not_equals(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, "!=", value)
    }

    pub fn greater_than(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, ">", value)
    }

    pub fn less_than(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, "<", value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, "contains", value)
    }

    pub fn in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, "in", Value::Array(values))
    }

    pub fn not_in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, "not_in", Value::Array(values))
    }

    /// Evaluate this condition against a payload. Unknown operators fail closed.
    pub fn matches(&self, payload: &Value) -> bool {
        let Some(operator) = ConditionOperator::parse(&self.operator) else {
            warn!(
                field = %self.field,
                operator = %self.operator,
                "Unknown condition operator, treating condition as false"
            );
            return false;
        };

        match resolve_field(payload, &self.field) {
            None => operator.matches_absent(),
            Some(actual) => compare(operator, actual, &self.value),
        }
    }
}

/// All conditions are ANDed; an empty list always matches.
pub fn evaluate(conditions: &[Condition], payload: &Value) -> bool {
    conditions.iter().all(|condition| condition.matches(payload))
}

/// Walk a dotted path through nested objects (and arrays, by numeric index).
/// `null` is reported as absent.
pub fn resolve_field<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;

    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    if current.is_null() { None } else { Some(current) }
}

fn compare(operator: ConditionOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => loose_eq(actual, expected),
        ConditionOperator::NotEquals => !loose_eq(actual, expected),
        ConditionOperator::GreaterThan => numeric_cmp(actual, expected).is_some_and(Ordering::is_gt),
        ConditionOperator::LessThan => numeric_cmp(actual, expected).is_some_and(Ordering::is_lt),
        ConditionOperator::GreaterThanOrEquals => numeric_cmp(actual, expected).is_some_and(Ordering::is_ge),
        ConditionOperator::LessThanOrEquals => numeric_cmp(actual, expected).is_some_and(Ordering::is_le),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::In => membership(actual, expected),
        ConditionOperator::NotIn => !membership(actual, expected),
    }
}

/// Numbers and numeric strings are compared by value, everything else structurally.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match numeric_cmp(actual, expected) {
        Some(ordering) => ordering.is_eq(),
        None => actual == expected,
    }
}

/// Exact decimal comparison, falling back to `f64` for magnitudes beyond
/// what `Decimal` can hold. `None` if either side is not numeric.
fn numeric_cmp(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (as_decimal(actual), as_decimal(expected)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => as_f64(actual)?.partial_cmp(&as_f64(expected)?),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => match as_text(expected) {
            Some(needle) => haystack.contains(needle.as_str()),
            None => false,
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        _ => false,
    }
}

fn membership(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|option| loose_eq(actual, option)),
        // A scalar expectation is a one-element list
        scalar => loose_eq(actual, scalar),
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Common conditions for finance workflows
pub mod presets {
    use super::*;

    /// Invoice total above a threshold
    pub fn invoice_above(amount: i64) -> Condition {
        Condition::greater_than("total_amount", amount)
    }

    /// Transaction pushed its budget line over the limit
    pub fn budget_exceeded() -> Condition {
        Condition::equals("budget_exceeded", true)
    }

    /// Bill carries the given payment terms
    pub fn payment_terms(terms: &str) -> Condition {
        Condition::equals("payment_terms", terms)
    }

    /// Invoice overdue for more than N days
    pub fn overdue_more_than(days: i64) -> Condition {
        Condition::greater_than("days_overdue", days)
    }
}
