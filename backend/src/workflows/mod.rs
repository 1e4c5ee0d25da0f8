// Workflow Automation Engine
//
// Contacts and deals are enrolled into workflows when a trigger matches a CRM
// event, then walked through a graph of actions, waits, branches and splits.

pub mod actions;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod enrollments;
pub mod errors;
pub mod executor;
pub mod matcher;
pub mod retry;
pub mod scheduler;
pub mod steps;
pub mod store;
pub mod timing;
pub mod triggers;

pub use actions::{
    ActionDispatcher, Collaborators, ContactDirectory, FieldUpdater, MessageSender, Notifier, RecordCreator,
    TagMutator,
};
pub use conditions::{Condition, ConditionGroup, ConditionOperator};
pub use definition::{Workflow, WorkflowDocument, WorkflowSettings, WorkflowStatus};
pub use engine::{EngineConfig, EventQueue, WorkerPool, WorkflowEngine};
pub use enrollments::{EnrollOutcome, Enrollment, EnrollmentSource, EnrollmentStatus, FailureReason};
pub use errors::{AutomationError, AutomationResult, DispatchError, StoreError};
pub use retry::RetryPolicy;
pub use scheduler::{DatePassReport, WakePassReport};
pub use steps::{Branch, Step, StepKind};
pub use store::{EnrollmentStore, InMemoryAutomationStore, PgAutomationStore, WorkflowStore};
pub use timing::{Clock, SystemClock, WaitUnit, WorkingHours};
pub use triggers::{DomainEvent, EventKind, RecordType, Trigger, TriggerSpec};
