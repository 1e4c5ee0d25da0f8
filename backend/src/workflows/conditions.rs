// Workflow Conditions - Predicate evaluation over a subject's record fields
//
// Used by trigger filters and by condition branches inside the step graph.
// Evaluation is total: a type mismatch yields `false`, never an error.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators supported by workflow predicates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    // Equality
    Equals,
    NotEquals,

    // String operations
    Contains,
    NotContains,
    StartsWith,
    EndsWith,

    // Numeric / date comparisons
    GreaterThan,
    LessThan,

    // Null/Empty checks
    IsEmpty,
    IsNotEmpty,

    // Set membership
    In,
    NotIn,
}

/// A single predicate: `<field> <operator> <value>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Field name to evaluate (supports dot notation for nested fields)
    pub field: String,
    pub operator: ConditionOperator,
    /// Operand; ignored by the emptiness checks
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    All,
    Any,
}

/// Group of conditions combined with all/any logic, optionally nested
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn is_empty(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsEmpty, Value::Null)
    }

    pub fn in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, ConditionOperator::In, Value::Array(values))
    }

    /// Evaluate this predicate against a record
    pub fn evaluate(&self, record: &Value) -> bool {
        evaluate(lookup(record, &self.field), self.operator, &self.value)
    }
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            logic: ConditionLogic::All,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            logic: ConditionLogic::Any,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn with_nested_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.groups.is_empty()
    }

    pub fn evaluate(&self, record: &Value) -> bool {
        let mut results = self
            .conditions
            .iter()
            .map(|c| c.evaluate(record))
            .chain(self.groups.iter().map(|g| g.evaluate(record)));

        match self.logic {
            ConditionLogic::All => results.all(|r| r),
            ConditionLogic::Any => results.any(|r| r),
        }
    }
}

/// Evaluate every filter; an empty list matches.
pub fn all_match(conditions: &[Condition], record: &Value) -> bool {
    conditions.iter().all(|c| c.evaluate(record))
}

/// Resolve a dot-separated path inside a record
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, part| match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Core predicate: `(field value, operator, operand) -> bool`
pub fn evaluate(field: Option<&Value>, operator: ConditionOperator, operand: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => field.is_some_and(|v| loosely_equal(v, operand)),
        ConditionOperator::NotEquals => !field.is_some_and(|v| loosely_equal(v, operand)),
        ConditionOperator::Contains => contains(field, operand),
        ConditionOperator::NotContains => !contains(field, operand),
        ConditionOperator::StartsWith => {
            string_form(field).starts_with(&string_form(Some(operand)))
        }
        ConditionOperator::EndsWith => string_form(field).ends_with(&string_form(Some(operand))),
        ConditionOperator::GreaterThan => {
            compare(field, operand).is_some_and(|o| o == std::cmp::Ordering::Greater)
        }
        ConditionOperator::LessThan => {
            compare(field, operand).is_some_and(|o| o == std::cmp::Ordering::Less)
        }
        ConditionOperator::IsEmpty => is_empty(field),
        ConditionOperator::IsNotEmpty => !is_empty(field),
        ConditionOperator::In => match operand.as_array() {
            Some(set) => field.is_some_and(|v| set.iter().any(|m| loosely_equal(v, m))),
            None => false,
        },
        ConditionOperator::NotIn => match operand.as_array() {
            Some(set) => !field.is_some_and(|v| set.iter().any(|m| loosely_equal(v, m))),
            None => false,
        },
    }
}

/// Lower-cased string form used by the string operators
fn string_form(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.to_lowercase(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string().to_lowercase(),
    }
}

fn loosely_equal(value: &Value, operand: &Value) -> bool {
    if value == operand {
        return true;
    }
    match (as_number(value), as_number(operand)) {
        (Some(a), Some(b)) => a == b,
        _ => {
            !value.is_array()
                && !value.is_object()
                && string_form(Some(value)) == string_form(Some(operand))
        }
    }
}

fn contains(field: Option<&Value>, operand: &Value) -> bool {
    match field {
        // Collections test membership rather than substring
        Some(Value::Array(items)) => items.iter().any(|item| loosely_equal(item, operand)),
        other => string_form(other).contains(&string_form(Some(operand))),
    }
}

fn is_empty(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Numbers compare numerically, otherwise both sides must parse as dates
fn compare(field: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (as_number(field), as_number(operand)) {
        return a.partial_cmp(&b);
    }
    match (as_date(field), as_date(operand)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}
