// Workflow Definition - Trigger + step graph + settings, parsed at save time

use chrono::{DateTime, FixedOffset, Offset, Utc};
use nurture_shared::StepValidationIssue;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

use super::steps::{Step, StepKind};
use super::timing::{WorkingHours, parse_timezone};
use super::triggers::Trigger;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Archived => "archived",
        }
    }

    /// Allowed status moves; activation additionally requires a valid graph.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Draft, Active) | (Paused, Active) | (Active, Paused) | (Draft | Active | Paused, Archived)
        )
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(WorkflowStatus::Draft),
            "active" => Ok(WorkflowStatus::Active),
            "paused" => Ok(WorkflowStatus::Paused),
            "archived" => Ok(WorkflowStatus::Archived),
            other => Err(format!("unknown workflow status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub allow_re_enrollment: bool,
    /// Cap on concurrently active enrollments
    #[serde(default)]
    pub enrollment_limit: Option<u32>,
    /// `UTC` or a fixed offset such as `-05:00`. Offsets do not track
    /// daylight saving; see `parse_timezone`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub working_hours: Option<WorkingHours>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            allow_re_enrollment: false,
            enrollment_limit: None,
            timezone: default_timezone(),
            working_hours: None,
        }
    }
}

impl WorkflowSettings {
    /// Offset used for working hours and date triggers; falls back to UTC
    pub fn offset(&self) -> FixedOffset {
        parse_timezone(&self.timezone).unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub trigger: Trigger,
    /// The first step is the entry point of every enrollment
    pub steps: Vec<Step>,
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Raw editor document; step and trigger configurations are untyped JSON
/// until `Workflow::from_document` parses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub name: String,
    pub trigger: serde_json::Value,
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(tenant_id: Uuid, name: &str, trigger: Trigger, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            status: WorkflowStatus::Draft,
            trigger,
            steps,
            settings: WorkflowSettings::default(),
            version: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Parse an editor document into typed steps, reporting every schema
    /// problem at once. Graph references are checked at activation.
    pub fn from_document(doc: WorkflowDocument) -> Result<Self, Vec<StepValidationIssue>> {
        let mut issues = Vec::new();

        let trigger = match serde_json::from_value::<Trigger>(doc.trigger) {
            Ok(trigger) => Some(trigger),
            Err(e) => {
                issues.push(StepValidationIssue::workflow("trigger", e.to_string()));
                None
            }
        };

        let mut steps = Vec::with_capacity(doc.steps.len());
        for (index, raw) in doc.steps.into_iter().enumerate() {
            let step_id = raw
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));
            match serde_json::from_value::<Step>(raw) {
                Ok(step) => {
                    issues.extend(step.local_issues());
                    steps.push(step);
                }
                Err(e) => issues.push(StepValidationIssue::step(&step_id, "kind", e.to_string())),
            }
        }

        if doc.name.trim().is_empty() {
            issues.push(StepValidationIssue::workflow("name", "workflow name is required"));
        }

        match trigger {
            Some(trigger) if issues.is_empty() => {
                let mut workflow = Workflow::new(doc.tenant_id, doc.name.trim(), trigger, steps);
                if let Some(id) = doc.id {
                    workflow.id = id;
                }
                workflow.settings = doc.settings;
                Ok(workflow)
            }
            _ => Err(issues),
        }
    }

    pub fn entry_step_id(&self) -> Option<&str> {
        self.steps.first().map(|s| s.id.as_str())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Full activation check: shape, settings, trigger and every reference.
    pub fn validate(&self) -> Vec<StepValidationIssue> {
        let mut issues = Vec::new();

        if self.steps.is_empty() {
            issues.push(StepValidationIssue::workflow("steps", "workflow has no steps"));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                issues.push(StepValidationIssue::step(&step.id, "id", "duplicate step id"));
            }
        }

        for step in &self.steps {
            issues.extend(step.local_issues());

            for (field, target) in step.references() {
                if !seen.contains(target) {
                    issues.push(StepValidationIssue::step(
                        &step.id,
                        field,
                        format!("references unknown step '{}'", target),
                    ));
                }
            }

            if let StepKind::Wait(wait) = &step.kind {
                if wait.working_hours_only && self.settings.working_hours.is_none() {
                    issues.push(StepValidationIssue::step(
                        &step.id,
                        "config.working_hours_only",
                        "working hours must be configured in workflow settings",
                    ));
                }
            }
        }

        issues.extend(self.trigger.issues());
        issues.extend(self.settings_issues());
        issues
    }

    fn settings_issues(&self) -> Vec<StepValidationIssue> {
        let mut issues = Vec::new();
        if parse_timezone(&self.settings.timezone).is_none() {
            issues.push(StepValidationIssue::workflow(
                "settings.timezone",
                format!(
                    "unsupported timezone '{}': use UTC or a fixed offset like +05:30",
                    self.settings.timezone
                ),
            ));
        }
        if self.settings.enrollment_limit == Some(0) {
            issues.push(StepValidationIssue::workflow(
                "settings.enrollment_limit",
                "enrollment limit must be at least 1",
            ));
        }
        if let Some(hours) = &self.settings.working_hours {
            if !hours.is_well_formed() {
                issues.push(StepValidationIssue::workflow(
                    "settings.working_hours",
                    "working hours need start before end and at least one day",
                ));
            }
        }
        issues
    }
}

/// Arena-style lookup of steps by id for the executor
pub struct StepGraph<'a> {
    steps: HashMap<&'a str, &'a Step>,
}

impl<'a> StepGraph<'a> {
    pub fn new(workflow: &'a Workflow) -> Self {
        Self {
            steps: workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a Step> {
        self.steps.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}
