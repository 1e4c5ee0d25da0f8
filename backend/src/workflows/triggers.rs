// Workflow Triggers - Domain events and the trigger definitions they match

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use nurture_shared::StepValidationIssue;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::conditions::{Condition, all_match};

/// Kinds of events emitted by the CRM record layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecordCreated,
    RecordUpdated,
    TagAdded,
    TagRemoved,
    StageChanged,
    FormSubmitted,
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event kind '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    #[default]
    Contact,
    Deal,
}

/// A change in the CRM that may enroll its subject (always a contact)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub tenant_id: Uuid,
    pub subject_id: Uuid,
    #[serde(default)]
    pub record_type: RecordType,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(kind: EventKind, tenant_id: Uuid, subject_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            tenant_id,
            subject_id,
            record_type: RecordType::Contact,
            changed_fields: Vec::new(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn record_created(tenant_id: Uuid, subject_id: Uuid, record_type: RecordType) -> Self {
        let mut event = Self::new(EventKind::RecordCreated, tenant_id, subject_id, serde_json::json!({}));
        event.record_type = record_type;
        event
    }

    pub fn record_updated(tenant_id: Uuid, subject_id: Uuid, changed_fields: &[&str]) -> Self {
        let mut event = Self::new(EventKind::RecordUpdated, tenant_id, subject_id, serde_json::json!({}));
        event.changed_fields = changed_fields.iter().map(|f| f.to_string()).collect();
        event
    }

    pub fn tag_added(tenant_id: Uuid, subject_id: Uuid, tag_id: &str) -> Self {
        Self::new(EventKind::TagAdded, tenant_id, subject_id, serde_json::json!({ "tag_id": tag_id }))
    }

    pub fn tag_removed(tenant_id: Uuid, subject_id: Uuid, tag_id: &str) -> Self {
        Self::new(EventKind::TagRemoved, tenant_id, subject_id, serde_json::json!({ "tag_id": tag_id }))
    }

    pub fn stage_changed(tenant_id: Uuid, subject_id: Uuid, pipeline_id: &str, to_stage_id: &str) -> Self {
        let mut event = Self::new(
            EventKind::StageChanged,
            tenant_id,
            subject_id,
            serde_json::json!({ "pipeline_id": pipeline_id, "stage_id": to_stage_id }),
        );
        event.record_type = RecordType::Deal;
        event
    }

    pub fn deal_created_in_pipeline(tenant_id: Uuid, subject_id: Uuid, pipeline_id: &str) -> Self {
        let mut event = Self::new(
            EventKind::RecordCreated,
            tenant_id,
            subject_id,
            serde_json::json!({ "pipeline_id": pipeline_id }),
        );
        event.record_type = RecordType::Deal;
        event
    }

    pub fn form_submitted(tenant_id: Uuid, subject_id: Uuid, form_id: &str, fields: serde_json::Value) -> Self {
        Self::new(
            EventKind::FormSubmitted,
            tenant_id,
            subject_id,
            serde_json::json!({ "form_id": form_id, "fields": fields }),
        )
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordTriggerConfig {
    #[serde(default)]
    pub record_type: Option<RecordType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordUpdatedConfig {
    #[serde(default)]
    pub record_type: Option<RecordType>,
    /// Only changes to these fields fire the trigger; empty means any field
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TagTriggerConfig {
    /// Empty means any tag
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageTriggerConfig {
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub to_stage_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineTriggerConfig {
    pub pipeline_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FormTriggerConfig {
    /// Empty means any form
    #[serde(default)]
    pub form_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DateTriggerConfig {
    /// Contact field holding the date (`YYYY-MM-DD` or RFC 3339)
    pub date_field: String,
    /// Days after the date (negative: before it)
    #[serde(default)]
    pub offset_days: i32,
    /// Local time of day at which subjects are evaluated
    pub run_at: NaiveTime,
    /// Match month and day only (birthdays, anniversaries)
    #[serde(default)]
    pub recurring_yearly: bool,
}

impl DateTriggerConfig {
    /// The stored date a subject must carry to qualify on `today`
    pub fn qualifying_date(&self, today: NaiveDate) -> NaiveDate {
        today - chrono::Duration::days(i64::from(self.offset_days))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum TriggerSpec {
    RecordCreated(RecordTriggerConfig),
    RecordUpdated(RecordUpdatedConfig),
    TagAdded(TagTriggerConfig),
    TagRemoved(TagTriggerConfig),
    StageChanged(StageTriggerConfig),
    RecordCreatedInPipeline(PipelineTriggerConfig),
    FormSubmitted(FormTriggerConfig),
    DateBased(DateTriggerConfig),
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub event: TriggerSpec,
    #[serde(default)]
    pub filters: Vec<Condition>,
}

impl Trigger {
    pub fn new(event: TriggerSpec) -> Self {
        Self {
            event,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.event {
            TriggerSpec::RecordCreated(_) => "record_created",
            TriggerSpec::RecordUpdated(_) => "record_updated",
            TriggerSpec::TagAdded(_) => "tag_added",
            TriggerSpec::TagRemoved(_) => "tag_removed",
            TriggerSpec::StageChanged(_) => "stage_changed",
            TriggerSpec::RecordCreatedInPipeline(_) => "record_created_in_pipeline",
            TriggerSpec::FormSubmitted(_) => "form_submitted",
            TriggerSpec::DateBased(_) => "date_based",
            TriggerSpec::Manual => "manual",
        }
    }

    /// Whether the event kind and the trigger's configuration agree. Filters
    /// are checked separately against the subject's record.
    pub fn matches_event(&self, event: &DomainEvent) -> bool {
        let record_type_ok = |wanted: &Option<RecordType>| wanted.is_none_or(|t| t == event.record_type);

        match (&self.event, event.kind) {
            (TriggerSpec::RecordCreated(config), EventKind::RecordCreated) => {
                record_type_ok(&config.record_type)
            }
            (TriggerSpec::RecordUpdated(config), EventKind::RecordUpdated) => {
                record_type_ok(&config.record_type)
                    && (config.fields.is_empty()
                        || event.changed_fields.iter().any(|f| config.fields.contains(f)))
            }
            (TriggerSpec::TagAdded(config), EventKind::TagAdded)
            | (TriggerSpec::TagRemoved(config), EventKind::TagRemoved) => {
                config.tag_ids.is_empty()
                    || event
                        .payload_str("tag_id")
                        .is_some_and(|tag| config.tag_ids.iter().any(|t| t == tag))
            }
            (TriggerSpec::StageChanged(config), EventKind::StageChanged) => {
                optional_eq(&config.pipeline_id, event.payload_str("pipeline_id"))
                    && optional_eq(&config.to_stage_id, event.payload_str("stage_id"))
            }
            (TriggerSpec::RecordCreatedInPipeline(config), EventKind::RecordCreated) => {
                event.payload_str("pipeline_id") == Some(config.pipeline_id.as_str())
            }
            (TriggerSpec::FormSubmitted(config), EventKind::FormSubmitted) => {
                optional_eq(&config.form_id, event.payload_str("form_id"))
            }
            _ => false,
        }
    }

    pub fn filters_match(&self, record: &serde_json::Value) -> bool {
        all_match(&self.filters, record)
    }

    pub fn issues(&self) -> Vec<StepValidationIssue> {
        let mut issues = Vec::new();
        match &self.event {
            TriggerSpec::RecordCreatedInPipeline(config) if config.pipeline_id.trim().is_empty() => {
                issues.push(StepValidationIssue::workflow("trigger.pipeline_id", "pipeline is required"));
            }
            TriggerSpec::DateBased(config) if config.date_field.trim().is_empty() => {
                issues.push(StepValidationIssue::workflow("trigger.date_field", "date field is required"));
            }
            _ => {}
        }
        for (index, filter) in self.filters.iter().enumerate() {
            if filter.field.trim().is_empty() {
                issues.push(StepValidationIssue::workflow(
                    &format!("trigger.filters[{}].field", index),
                    "filter field is required",
                ));
            }
        }
        issues
    }
}

fn optional_eq(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted {
        Some(wanted) => actual == Some(wanted.as_str()),
        None => true,
    }
}
