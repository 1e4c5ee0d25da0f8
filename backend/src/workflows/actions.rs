// Workflow Actions - Collaborator interfaces and the action dispatcher
//
// The dispatcher performs exactly one call per invocation and never retries;
// attempt counting lives on the enrollment so it survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conditions::lookup;
use super::errors::DispatchError;
use super::steps::{MessageChannel, StepKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub channel: MessageChannel,
    pub template_id: Option<String>,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TagOperation {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub subject_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub assignee_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDeal {
    pub subject_id: Uuid,
    pub title: String,
    pub pipeline_id: String,
    pub stage_id: String,
    pub amount: Option<f64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, subject_id: Uuid, message: &OutboundMessage) -> Result<(), DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TagMutator: Send + Sync {
    async fn mutate_tags(
        &self,
        subject_id: Uuid,
        tag_ids: &[String],
        operation: TagOperation,
    ) -> Result<(), DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FieldUpdater: Send + Sync {
    async fn update_field(
        &self,
        subject_id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordCreator: Send + Sync {
    async fn create_task(&self, task: &NewTask) -> Result<Uuid, DispatchError>;
    async fn create_deal(&self, deal: &NewDeal) -> Result<Uuid, DispatchError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[String], subject: &str, message: &str) -> Result<(), DispatchError>;
}

/// Read-only view of CRM records, used for filters, conditions and templates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn fetch_record(&self, subject_id: Uuid) -> Result<Option<serde_json::Value>, DispatchError>;

    /// Subjects of a tenant whose `field` holds `date`; `ignore_year` matches
    /// month and day only.
    async fn subjects_with_date(
        &self,
        tenant_id: Uuid,
        field: &str,
        date: NaiveDate,
        ignore_year: bool,
    ) -> Result<Vec<Uuid>, DispatchError>;
}

/// Handles to every external collaborator the engine calls
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageSender>,
    pub tags: Arc<dyn TagMutator>,
    pub fields: Arc<dyn FieldUpdater>,
    pub records: Arc<dyn RecordCreator>,
    pub notifier: Arc<dyn Notifier>,
    pub directory: Arc<dyn ContactDirectory>,
}

/// Result of a successful dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub output: Option<serde_json::Value>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(output: Option<serde_json::Value>) -> Self {
        Self { output, duration_ms: 0 }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

pub struct ActionDispatcher {
    collaborators: Collaborators,
    timeout: std::time::Duration,
}

impl ActionDispatcher {
    pub fn new(collaborators: Collaborators, timeout: std::time::Duration) -> Self {
        Self { collaborators, timeout }
    }

    pub fn directory(&self) -> &Arc<dyn ContactDirectory> {
        &self.collaborators.directory
    }

    /// Current record state of the subject; a missing record reads as `{}`.
    pub async fn fetch_record(&self, subject_id: Uuid) -> Result<serde_json::Value, DispatchError> {
        match tokio::time::timeout(self.timeout, self.collaborators.directory.fetch_record(subject_id)).await {
            Ok(Ok(record)) => Ok(record.unwrap_or_else(|| serde_json::json!({}))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DispatchError::Transient("record lookup timed out".to_string())),
        }
    }

    /// Run one action step's side effect. A call exceeding the timeout is
    /// reported as transient.
    pub async fn dispatch(
        &self,
        kind: &StepKind,
        subject_id: Uuid,
        record: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ActionResult, DispatchError> {
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.call(kind, subject_id, record, now)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(subject_id = %subject_id, step_kind = kind.name(), "Action dispatch timed out");
                Err(DispatchError::Transient(format!(
                    "{} timed out after {}s",
                    kind.name(),
                    self.timeout.as_secs()
                )))
            }
        };

        let duration = start.elapsed().as_millis() as i64;
        result.map(|r| r.with_duration(duration))
    }

    async fn call(
        &self,
        kind: &StepKind,
        subject_id: Uuid,
        record: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ActionResult, DispatchError> {
        let c = &self.collaborators;
        match kind {
            StepKind::SendMessage(config) => {
                let message = OutboundMessage {
                    channel: config.channel,
                    template_id: config.template_id.clone(),
                    subject: config.subject.as_deref().map(|s| render_template(s, record)),
                    body: render_template(&config.body, record),
                };
                c.messages.send_message(subject_id, &message).await?;
                debug!(subject_id = %subject_id, channel = ?config.channel, "Message dispatched");
                Ok(ActionResult::success(None))
            }
            StepKind::AddTag(config) => {
                c.tags.mutate_tags(subject_id, &config.tag_ids, TagOperation::Add).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "added": config.tag_ids }))))
            }
            StepKind::RemoveTag(config) => {
                c.tags.mutate_tags(subject_id, &config.tag_ids, TagOperation::Remove).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "removed": config.tag_ids }))))
            }
            StepKind::UpdateField(config) => {
                let value = render_value(&config.value, record);
                c.fields.update_field(subject_id, &config.field, &value).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "field": config.field, "value": value }))))
            }
            StepKind::CreateTask(config) => {
                let task = NewTask {
                    subject_id,
                    title: render_template(&config.title, record),
                    description: config.description.as_deref().map(|d| render_template(d, record)),
                    due_at: config.due_in_days.map(|days| now + Duration::days(i64::from(days))),
                    assignee_id: config.assignee_id,
                };
                let task_id = c.records.create_task(&task).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "task_id": task_id }))))
            }
            StepKind::CreateDeal(config) => {
                let deal = NewDeal {
                    subject_id,
                    title: render_template(&config.title, record),
                    pipeline_id: config.pipeline_id.clone(),
                    stage_id: config.stage_id.clone(),
                    amount: config.amount,
                };
                let deal_id = c.records.create_deal(&deal).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "deal_id": deal_id }))))
            }
            StepKind::Notify(config) => {
                let subject = render_template(&config.subject, record);
                let message = render_template(&config.message, record);
                c.notifier.notify(&config.recipients, &subject, &message).await?;
                Ok(ActionResult::success(None))
            }
            StepKind::Wait(_) | StepKind::Condition | StepKind::Split(_) | StepKind::Jump(_) | StepKind::End => {
                Err(DispatchError::Permanent(format!("{} is not an action step", kind.name())))
            }
        }
    }
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}\s]+)\s*\}\}").expect("placeholder pattern is valid"));

/// Replace `{{field.path}}` placeholders with values from the subject record.
/// Unknown paths render as an empty string.
pub fn render_template(template: &str, record: &serde_json::Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| match lookup(record, &caps[1]) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

/// Apply `render_template` to every string inside a JSON value
pub fn render_value(value: &serde_json::Value, record: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(render_template(s, record)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_value(v, record)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, record)))
                .collect(),
        ),
        other => other.clone(),
    }
}
