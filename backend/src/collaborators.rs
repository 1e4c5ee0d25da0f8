//! Default collaborator adapters for standalone deployments
//!
//! Every action is written to the log and reported as delivered. The
//! directory knows no records, so filters and conditions see an empty
//! object. Deployments embedding the engine pass their own `Collaborators`.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::workflows::actions::{
    Collaborators, ContactDirectory, FieldUpdater, MessageSender, NewDeal, NewTask, Notifier, OutboundMessage,
    RecordCreator, TagMutator, TagOperation,
};
use crate::workflows::errors::DispatchError;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCollaborators;

impl LoggingCollaborators {
    pub fn collaborators() -> Collaborators {
        let adapter = Arc::new(LoggingCollaborators);
        Collaborators {
            messages: adapter.clone(),
            tags: adapter.clone(),
            fields: adapter.clone(),
            records: adapter.clone(),
            notifier: adapter.clone(),
            directory: adapter,
        }
    }
}

#[async_trait]
impl MessageSender for LoggingCollaborators {
    async fn send_message(&self, subject_id: Uuid, message: &OutboundMessage) -> Result<(), DispatchError> {
        info!(
            subject_id = %subject_id,
            channel = ?message.channel,
            template_id = ?message.template_id,
            "Message queued for delivery"
        );
        Ok(())
    }
}

#[async_trait]
impl TagMutator for LoggingCollaborators {
    async fn mutate_tags(
        &self,
        subject_id: Uuid,
        tag_ids: &[String],
        operation: TagOperation,
    ) -> Result<(), DispatchError> {
        info!(subject_id = %subject_id, ?operation, tags = ?tag_ids, "Tags changed");
        Ok(())
    }
}

#[async_trait]
impl FieldUpdater for LoggingCollaborators {
    async fn update_field(
        &self,
        subject_id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), DispatchError> {
        info!(subject_id = %subject_id, field, %value, "Field updated");
        Ok(())
    }
}

#[async_trait]
impl RecordCreator for LoggingCollaborators {
    async fn create_task(&self, task: &NewTask) -> Result<Uuid, DispatchError> {
        let id = Uuid::new_v4();
        info!(task_id = %id, subject_id = %task.subject_id, title = %task.title, "Task created");
        Ok(id)
    }

    async fn create_deal(&self, deal: &NewDeal) -> Result<Uuid, DispatchError> {
        let id = Uuid::new_v4();
        info!(deal_id = %id, subject_id = %deal.subject_id, pipeline_id = %deal.pipeline_id, "Deal created");
        Ok(id)
    }
}

#[async_trait]
impl Notifier for LoggingCollaborators {
    async fn notify(&self, recipients: &[String], subject: &str, _message: &str) -> Result<(), DispatchError> {
        info!(recipients = recipients.len(), subject, "Internal notification sent");
        Ok(())
    }
}

#[async_trait]
impl ContactDirectory for LoggingCollaborators {
    async fn fetch_record(&self, _subject_id: Uuid) -> Result<Option<serde_json::Value>, DispatchError> {
        Ok(None)
    }

    async fn subjects_with_date(
        &self,
        _tenant_id: Uuid,
        _field: &str,
        _date: NaiveDate,
        _ignore_year: bool,
    ) -> Result<Vec<Uuid>, DispatchError> {
        Ok(Vec::new())
    }
}
