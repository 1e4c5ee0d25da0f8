// Trigger Matcher - Maps domain events onto enrollments in active workflows

use std::sync::Arc;
use tracing::{debug, error, warn};

use super::actions::ActionDispatcher;
use super::definition::Workflow;
use super::enrollments::{EnrollOutcome, EnrollmentManager, EnrollmentSource};
use super::errors::AutomationResult;
use super::store::WorkflowStore;
use super::triggers::{DomainEvent, EventKind};

pub struct TriggerMatcher {
    workflows: Arc<dyn WorkflowStore>,
    manager: Arc<EnrollmentManager>,
    dispatcher: Arc<ActionDispatcher>,
}

impl TriggerMatcher {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        manager: Arc<EnrollmentManager>,
        dispatcher: Arc<ActionDispatcher>,
    ) -> Self {
        Self {
            workflows,
            manager,
            dispatcher,
        }
    }

    /// Active workflows of the event's tenant whose trigger accepts the event
    pub async fn candidates(&self, event: &DomainEvent) -> AutomationResult<Vec<Workflow>> {
        let active = self.workflows.list_active_workflows(Some(event.tenant_id)).await?;
        Ok(active
            .into_iter()
            .filter(|w| w.trigger.matches_event(event))
            .collect())
    }

    /// Evaluate the event against every candidate workflow and enroll the
    /// subject where filters pass. Failures are isolated per workflow. Never
    /// writes to the subject record.
    pub async fn match_event(&self, event: &DomainEvent) -> AutomationResult<Vec<(Workflow, EnrollOutcome)>> {
        let candidates = self.candidates(event).await?;
        if candidates.is_empty() {
            debug!(event_id = %event.event_id, kind = ?event.kind, "No workflow matches event");
            return Ok(Vec::new());
        }

        let source = match event.kind {
            EventKind::FormSubmitted => EnrollmentSource::Form,
            _ => EnrollmentSource::Event,
        };

        // Loaded once per event, only if some candidate filters on it
        let mut record: Option<serde_json::Value> = None;
        let mut record_error = false;
        let mut results = Vec::with_capacity(candidates.len());

        for workflow in candidates {
            if !workflow.trigger.filters.is_empty() {
                if record.is_none() && !record_error {
                    match self.dispatcher.fetch_record(event.subject_id).await {
                        Ok(mut value) => {
                            merge_form_fields(&mut value, event);
                            record = Some(value);
                        }
                        Err(e) => {
                            warn!(
                                event_id = %event.event_id,
                                subject_id = %event.subject_id,
                                error = %e,
                                "Trigger filters skipped: subject record unavailable"
                            );
                            record_error = true;
                        }
                    }
                }
                let passes = record.as_ref().is_some_and(|r| workflow.trigger.filters_match(r));
                if !passes {
                    debug!(workflow_id = %workflow.id, subject_id = %event.subject_id, "Trigger filters did not match");
                    results.push((workflow, EnrollOutcome::FilteredOut));
                    continue;
                }
            }

            match self.manager.enroll(&workflow, event.subject_id, source).await {
                Ok(outcome) => results.push((workflow, outcome)),
                Err(e) => {
                    error!(
                        workflow_id = %workflow.id,
                        subject_id = %event.subject_id,
                        error = %e,
                        "Enrollment from event failed"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Operator-initiated enrollment; bypasses event matching and filters
    pub async fn enroll_manually(&self, workflow: &Workflow, subject_id: uuid::Uuid) -> AutomationResult<EnrollOutcome> {
        self.manager.enroll(workflow, subject_id, EnrollmentSource::Manual).await
    }
}

/// Submitted form values are visible to filters under `form.*`
fn merge_form_fields(record: &mut serde_json::Value, event: &DomainEvent) {
    if event.kind != EventKind::FormSubmitted {
        return;
    }
    if let (Some(map), Some(fields)) = (record.as_object_mut(), event.payload.get("fields")) {
        map.insert("form".to_string(), fields.clone());
    }
}
