// Workflow Steps - Nodes of the automation graph
//
// Each step kind carries only its own configuration. The editor stores steps
// as `{ "id", "kind": { "type": ..., "config": ... }, "next_step_id", ... }`
// and they are parsed into these variants when a workflow is saved.

use nurture_shared::StepValidationIssue;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::conditions::ConditionGroup;
use super::timing::{WaitUnit, MAX_WAIT_SECS};

pub type StepId = String;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    pub kind: StepKind,
    /// Editor layout only, never read by the engine
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub next_step_id: Option<StepId>,
    /// Outgoing edges of condition and split steps, in evaluation order
    #[serde(default)]
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Absent predicate acts as the `else` branch of a condition step
    #[serde(default)]
    pub predicate: Option<ConditionGroup>,
    /// Share of enrollments for percentage splits
    #[serde(default)]
    pub percentage: Option<u32>,
    #[serde(default)]
    pub next_step_id: Option<StepId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum StepKind {
    // Actions
    SendMessage(SendMessageConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    UpdateField(UpdateFieldConfig),
    CreateTask(CreateTaskConfig),
    CreateDeal(CreateDealConfig),
    Notify(NotifyConfig),

    // Logic
    Wait(WaitConfig),
    Condition,
    Split(SplitConfig),
    Jump(JumpConfig),
    End,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct SendMessageConfig {
    pub channel: MessageChannel,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[validate(length(min = 1, message = "message body is required"))]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct TagConfig {
    #[validate(length(min = 1, message = "at least one tag is required"))]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct UpdateFieldConfig {
    #[validate(length(min = 1, message = "field name is required"))]
    pub field: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct CreateTaskConfig {
    #[validate(length(min = 1, max = 255, message = "task title must be 1-255 characters"))]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_in_days: Option<u32>,
    #[serde(default)]
    pub assignee_id: Option<uuid::Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct CreateDealConfig {
    #[validate(length(min = 1, max = 255, message = "deal title must be 1-255 characters"))]
    pub title: String,
    #[validate(length(min = 1, message = "pipeline is required"))]
    pub pipeline_id: String,
    #[validate(length(min = 1, message = "stage is required"))]
    pub stage_id: String,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct NotifyConfig {
    #[validate(length(min = 1, message = "at least one recipient is required"))]
    pub recipients: Vec<String>,
    #[validate(length(min = 1, message = "subject is required"))]
    pub subject: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct WaitConfig {
    #[validate(range(min = 1, message = "wait amount must be positive"))]
    pub amount: u32,
    pub unit: WaitUnit,
    #[serde(default)]
    pub working_hours_only: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    #[default]
    Percentage,
    Random,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    #[serde(default)]
    pub mode: SplitMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct JumpConfig {
    #[validate(length(min = 1, message = "jump target is required"))]
    pub target_step_id: StepId,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::SendMessage(_) => "send_message",
            StepKind::AddTag(_) => "add_tag",
            StepKind::RemoveTag(_) => "remove_tag",
            StepKind::UpdateField(_) => "update_field",
            StepKind::CreateTask(_) => "create_task",
            StepKind::CreateDeal(_) => "create_deal",
            StepKind::Notify(_) => "notify",
            StepKind::Wait(_) => "wait",
            StepKind::Condition => "condition",
            StepKind::Split(_) => "split",
            StepKind::Jump(_) => "jump",
            StepKind::End => "end",
        }
    }

    /// Action kinds produce an external side effect through the dispatcher
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            StepKind::SendMessage(_)
                | StepKind::AddTag(_)
                | StepKind::RemoveTag(_)
                | StepKind::UpdateField(_)
                | StepKind::CreateTask(_)
                | StepKind::CreateDeal(_)
                | StepKind::Notify(_)
        )
    }

    fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            StepKind::SendMessage(c) => c.validate(),
            StepKind::AddTag(c) | StepKind::RemoveTag(c) => c.validate(),
            StepKind::UpdateField(c) => c.validate(),
            StepKind::CreateTask(c) => c.validate(),
            StepKind::CreateDeal(c) => c.validate(),
            StepKind::Notify(c) => c.validate(),
            StepKind::Wait(c) => c.validate(),
            StepKind::Jump(c) => c.validate(),
            StepKind::Condition | StepKind::Split(_) | StepKind::End => Ok(()),
        }
    }
}

impl Step {
    pub fn new(id: &str, kind: StepKind, next_step_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            kind,
            position: Position::default(),
            next_step_id: next_step_id.map(str::to_string),
            branches: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Shape checks that only need the step itself
    pub fn local_issues(&self) -> Vec<StepValidationIssue> {
        let mut issues = Vec::new();

        if let Err(errors) = self.kind.validate_config() {
            issues.push(StepValidationIssue::step(&self.id, "config", errors.to_string()));
        }

        if let StepKind::Wait(config) = &self.kind {
            if config.unit.seconds() * i64::from(config.amount) > MAX_WAIT_SECS {
                issues.push(StepValidationIssue::step(
                    &self.id,
                    "config.amount",
                    "wait may not be longer than 5 years",
                ));
            }
        }

        match &self.kind {
            StepKind::Condition => {
                if self.branches.is_empty() {
                    issues.push(StepValidationIssue::step(
                        &self.id,
                        "branches",
                        "condition step needs at least one branch",
                    ));
                }
                let else_count = self.branches.iter().filter(|b| b.predicate.is_none()).count();
                if else_count > 1 {
                    issues.push(StepValidationIssue::step(
                        &self.id,
                        "branches",
                        "only one branch may omit its predicate",
                    ));
                }
            }
            StepKind::Split(config) => {
                if self.branches.len() < 2 {
                    issues.push(StepValidationIssue::step(
                        &self.id,
                        "branches",
                        "split step needs at least two branches",
                    ));
                }
                if config.mode == SplitMode::Percentage {
                    let missing = self.branches.iter().any(|b| b.percentage.is_none());
                    if self.branches.iter().any(|b| b.percentage.is_some_and(|p| p > 100)) {
                        issues.push(StepValidationIssue::step(
                            &self.id,
                            "branches",
                            "a split percentage may not exceed 100",
                        ));
                    }
                    let total: u64 = self.branches.iter().filter_map(|b| b.percentage).map(u64::from).sum();
                    if missing || total != 100 {
                        issues.push(StepValidationIssue::step(
                            &self.id,
                            "branches",
                            format!("split percentages must all be set and sum to 100 (got {})", total),
                        ));
                    }
                }
            }
            _ => {
                if !self.branches.is_empty() {
                    issues.push(StepValidationIssue::step(
                        &self.id,
                        "branches",
                        format!("{} steps do not take branches", self.kind.name()),
                    ));
                }
            }
        }

        issues
    }

    /// Every step id this step can route to
    pub fn references(&self) -> impl Iterator<Item = (&'static str, &str)> {
        let jump = match &self.kind {
            StepKind::Jump(config) => Some(("target_step_id", config.target_step_id.as_str())),
            _ => None,
        };
        self.next_step_id
            .as_deref()
            .map(|id| ("next_step_id", id))
            .into_iter()
            .chain(
                self.branches
                    .iter()
                    .filter_map(|b| b.next_step_id.as_deref().map(|id| ("branches.next_step_id", id))),
            )
            .chain(jump)
    }
}

impl Branch {
    pub fn when(id: &str, predicate: ConditionGroup, next_step_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            predicate: Some(predicate),
            percentage: None,
            next_step_id: next_step_id.map(str::to_string),
        }
    }

    pub fn otherwise(id: &str, next_step_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            predicate: None,
            percentage: None,
            next_step_id: next_step_id.map(str::to_string),
        }
    }

    pub fn share(id: &str, percentage: u32, next_step_id: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            predicate: None,
            percentage: Some(percentage),
            next_step_id: next_step_id.map(str::to_string),
        }
    }
}
