// Shared test doubles: a settable clock, a recording CRM, and an engine harness

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

use crate::workflows::actions::{
    Collaborators, ContactDirectory, FieldUpdater, MessageSender, NewDeal, NewTask, Notifier, OutboundMessage,
    RecordCreator, TagMutator, TagOperation,
};
use crate::workflows::definition::Workflow;
use crate::workflows::engine::{EngineConfig, WorkerPool, WorkflowEngine};
use crate::workflows::enrollments::Enrollment;
use crate::workflows::errors::DispatchError;
use crate::workflows::store::{EnrollmentStore, InMemoryAutomationStore, WorkflowStore};
use crate::workflows::timing::Clock;
use crate::AppState;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init()
            .ok();
    });
}

/// Monday 2024-03-04 09:00 UTC
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Recording stand-in for every CRM collaborator
#[derive(Default)]
pub struct FakeCrm {
    records: Mutex<HashMap<Uuid, Value>>,
    dates: Mutex<Vec<(Uuid, Uuid, String, NaiveDate)>>,
    messages: Mutex<Vec<(Uuid, OutboundMessage)>>,
    tag_calls: Mutex<Vec<(Uuid, Vec<String>, TagOperation)>>,
    field_updates: Mutex<Vec<(Uuid, String, Value)>>,
    tasks: Mutex<Vec<(Uuid, NewTask)>>,
    deals: Mutex<Vec<NewDeal>>,
    notifications: Mutex<Vec<(Vec<String>, String, String)>>,
    message_failures: Mutex<VecDeque<DispatchError>>,
    record_failure: Mutex<Option<DispatchError>>,
    message_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeCrm {
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            messages: self.clone(),
            tags: self.clone(),
            fields: self.clone(),
            records: self.clone(),
            notifier: self.clone(),
            directory: self.clone(),
        }
    }

    pub fn set_record(&self, subject_id: Uuid, record: Value) {
        self.records.lock().unwrap().insert(subject_id, record);
    }

    /// Register a date-valued field for date-trigger lookups
    pub fn set_date(&self, tenant_id: Uuid, subject_id: Uuid, field: &str, date: NaiveDate) {
        self.dates
            .lock()
            .unwrap()
            .push((tenant_id, subject_id, field.to_string(), date));
    }

    /// The next sends fail with these errors, in order
    pub fn fail_next_messages(&self, errors: Vec<DispatchError>) {
        self.message_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_record_lookups(&self, error: Option<DispatchError>) {
        *self.record_failure.lock().unwrap() = error;
    }

    pub fn delay_messages(&self, delay: std::time::Duration) {
        *self.message_delay.lock().unwrap() = Some(delay);
    }

    pub fn messages(&self) -> Vec<(Uuid, OutboundMessage)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn messages_to(&self, subject_id: Uuid) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == subject_id)
            .count()
    }

    pub fn tag_calls(&self) -> Vec<(Uuid, Vec<String>, TagOperation)> {
        self.tag_calls.lock().unwrap().clone()
    }

    pub fn field_updates(&self) -> Vec<(Uuid, String, Value)> {
        self.field_updates.lock().unwrap().clone()
    }

    /// Created tasks with the ids handed back to the engine
    pub fn tasks(&self) -> Vec<(Uuid, NewTask)> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn deals(&self) -> Vec<NewDeal> {
        self.deals.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<(Vec<String>, String, String)> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for FakeCrm {
    async fn send_message(&self, subject_id: Uuid, message: &OutboundMessage) -> Result<(), DispatchError> {
        let delay = *self.message_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.message_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.messages.lock().unwrap().push((subject_id, message.clone()));
        Ok(())
    }
}

#[async_trait]
impl TagMutator for FakeCrm {
    async fn mutate_tags(
        &self,
        subject_id: Uuid,
        tag_ids: &[String],
        operation: TagOperation,
    ) -> Result<(), DispatchError> {
        self.tag_calls
            .lock()
            .unwrap()
            .push((subject_id, tag_ids.to_vec(), operation));
        Ok(())
    }
}

#[async_trait]
impl FieldUpdater for FakeCrm {
    async fn update_field(&self, subject_id: Uuid, field: &str, value: &Value) -> Result<(), DispatchError> {
        self.field_updates
            .lock()
            .unwrap()
            .push((subject_id, field.to_string(), value.clone()));
        Ok(())
    }
}

#[async_trait]
impl RecordCreator for FakeCrm {
    async fn create_task(&self, task: &NewTask) -> Result<Uuid, DispatchError> {
        let id = Uuid::new_v4();
        self.tasks.lock().unwrap().push((id, task.clone()));
        Ok(id)
    }

    async fn create_deal(&self, deal: &NewDeal) -> Result<Uuid, DispatchError> {
        self.deals.lock().unwrap().push(deal.clone());
        Ok(Uuid::new_v4())
    }
}

#[async_trait]
impl Notifier for FakeCrm {
    async fn notify(&self, recipients: &[String], subject: &str, message: &str) -> Result<(), DispatchError> {
        self.notifications
            .lock()
            .unwrap()
            .push((recipients.to_vec(), subject.to_string(), message.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ContactDirectory for FakeCrm {
    async fn fetch_record(&self, subject_id: Uuid) -> Result<Option<Value>, DispatchError> {
        if let Some(error) = self.record_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.records.lock().unwrap().get(&subject_id).cloned())
    }

    async fn subjects_with_date(
        &self,
        tenant_id: Uuid,
        field: &str,
        date: NaiveDate,
        ignore_year: bool,
    ) -> Result<Vec<Uuid>, DispatchError> {
        Ok(self
            .dates
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, f, d)| {
                *t == tenant_id
                    && f == field
                    && if ignore_year {
                        d.month() == date.month() && d.day() == date.day()
                    } else {
                        *d == date
                    }
            })
            .map(|(_, s, _, _)| *s)
            .collect())
    }
}

/// Engine wired to the in-memory store, a manual clock and a fake CRM
pub struct TestHarness {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<InMemoryAutomationStore>,
    pub clock: Arc<ManualClock>,
    pub crm: Arc<FakeCrm>,
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        event_queue_capacity: 64,
        dispatch_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_engine_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_test_logging();
        let store = Arc::new(InMemoryAutomationStore::new());
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let crm = Arc::new(FakeCrm::default());
        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            store.clone(),
            crm.collaborators(),
            clock.clone(),
            config,
        ));
        Self {
            engine,
            store,
            clock,
            crm,
        }
    }

    /// Store the workflow and activate it; panics on validation issues
    pub async fn install(&self, workflow: Workflow) -> Workflow {
        let id = workflow.id;
        self.store.save_workflow(&workflow).await.unwrap();
        let report = self.engine.activate(id).await.unwrap();
        assert!(report.activated, "activation failed: {:?}", report.issues);
        self.engine.get_workflow(id).await.unwrap()
    }

    pub async fn enrollment(&self, id: Uuid) -> Enrollment {
        self.store.get_enrollment(id).await.unwrap().unwrap()
    }

    pub async fn enrollments_of(&self, workflow_id: Uuid) -> Vec<Enrollment> {
        self.store
            .list_enrollments(workflow_id, None, 0, 10_000)
            .await
            .unwrap()
            .0
    }

    /// Enroll a subject by hand and return the enrollment after its first pass
    pub async fn enroll(&self, workflow_id: Uuid, subject_id: Uuid) -> Enrollment {
        let outcome = self.engine.enroll_manually(workflow_id, subject_id).await.unwrap();
        let enrollment = outcome
            .enrollment()
            .unwrap_or_else(|| panic!("subject not enrolled: {}", outcome.as_str()));
        self.enrollment(enrollment.id).await
    }

    pub fn app_state(&self, pool: &WorkerPool) -> Arc<AppState> {
        Arc::new(AppState {
            engine: self.engine.clone(),
            events: pool.queue(),
            db_pool: None,
        })
    }
}

/// A contact record with the usual fields filters look at
pub fn contact(email: &str, lifecycle: &str) -> Value {
    json!({
        "email": email,
        "first_name": "Ada",
        "lifecycle_stage": lifecycle,
        "lead_score": 42,
    })
}
