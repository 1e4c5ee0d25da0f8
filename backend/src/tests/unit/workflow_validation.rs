// Unit tests for workflow definitions and activation checks

use crate::tests::fixtures::*;
use crate::workflows::definition::{Workflow, WorkflowDocument, WorkflowSettings, WorkflowStatus};
use crate::workflows::steps::{SplitMode, Step, StepKind};
use crate::workflows::timing::{WaitUnit, WorkingHours};
use chrono::NaiveTime;
use serde_json::json;
use uuid::Uuid;

fn issue_fields(workflow: &Workflow) -> Vec<(Option<String>, String)> {
    workflow
        .validate()
        .into_iter()
        .map(|i| (i.step_id, i.field))
        .collect()
}

// ============================================
// Graph reference checks
// ============================================

#[cfg(test)]
mod reference_tests {
    use super::*;

    #[test]
    fn test_well_formed_workflow_has_no_issues() {
        let workflow = lead_nurture(Uuid::new_v4());
        assert!(workflow.validate().is_empty());
        assert_eq!(workflow.entry_step_id(), Some("tag-lead"));
    }

    #[test]
    fn test_dangling_next_step_is_reported() {
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![add_tag("tag", "lead", Some("missing")), end("done")],
        );

        let issues = issue_fields(&workflow);
        assert_eq!(issues, vec![(Some("tag".to_string()), "next_step_id".to_string())]);
    }

    #[test]
    fn test_dangling_branch_target_is_reported() {
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![
                branch_on("check", "lifecycle_stage", json!("lead"), "done", "nowhere"),
                end("done"),
            ],
        );

        let issues = issue_fields(&workflow);
        assert_eq!(
            issues,
            vec![(Some("check".to_string()), "branches.next_step_id".to_string())]
        );
    }

    #[test]
    fn test_dangling_jump_target_is_reported() {
        let workflow = manual_workflow(Uuid::new_v4(), vec![jump("loop", "gone")]);
        let issues = issue_fields(&workflow);
        assert!(issues.contains(&(Some("loop".to_string()), "target_step_id".to_string())));
    }

    #[test]
    fn test_duplicate_step_ids_are_reported() {
        let workflow = manual_workflow(Uuid::new_v4(), vec![end("done"), end("done")]);
        let issues = issue_fields(&workflow);
        assert!(issues.contains(&(Some("done".to_string()), "id".to_string())));
    }

    #[test]
    fn test_empty_workflow_is_rejected() {
        let workflow = manual_workflow(Uuid::new_v4(), Vec::new());
        let issues = issue_fields(&workflow);
        assert_eq!(issues, vec![(None, "steps".to_string())]);
        assert!(workflow.entry_step_id().is_none());
    }

    #[test]
    fn test_cycles_are_allowed_at_activation() {
        // Loops are legal graphs; the executor's hop limit guards them at runtime
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![jump("ping", "pong"), jump("pong", "ping")],
        );
        assert!(workflow.validate().is_empty());
    }
}

// ============================================
// Step shape checks
// ============================================

#[cfg(test)]
mod shape_tests {
    use super::*;

    #[test]
    fn test_split_percentages_must_sum_to_100() {
        let mut split = even_split("split", SplitMode::Percentage, "a", "b");
        split.branches[1].percentage = Some(40);
        let workflow = manual_workflow(Uuid::new_v4(), vec![split, end("a"), end("b")]);

        let issues = workflow.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "branches");
        assert!(issues[0].message.contains("90"));
    }

    #[test]
    fn test_random_split_ignores_percentages() {
        let mut split = even_split("split", SplitMode::Random, "a", "b");
        split.branches[0].percentage = None;
        let workflow = manual_workflow(Uuid::new_v4(), vec![split, end("a"), end("b")]);
        assert!(workflow.validate().is_empty());
    }

    #[test]
    fn test_condition_without_branches_is_rejected() {
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![Step::new("check", StepKind::Condition, Some("done")), end("done")],
        );
        let issues = issue_fields(&workflow);
        assert_eq!(issues, vec![(Some("check".to_string()), "branches".to_string())]);
    }

    #[test]
    fn test_zero_wait_is_rejected() {
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![wait("pause", 0, WaitUnit::Hours, Some("done")), end("done")],
        );
        let issues = issue_fields(&workflow);
        assert_eq!(issues, vec![(Some("pause".to_string()), "config".to_string())]);
    }

    #[test]
    fn test_huge_split_percentages_are_rejected_without_overflow() {
        let mut split = even_split("split", SplitMode::Percentage, "a", "b");
        split.branches[0].percentage = Some(4_000_000_000);
        split.branches[1].percentage = Some(4_000_000_000);
        let workflow = manual_workflow(Uuid::new_v4(), vec![split, end("a"), end("b")]);

        let messages: Vec<String> = workflow.validate().into_iter().map(|i| i.message).collect();
        assert!(messages.iter().any(|m| m.contains("may not exceed 100")));
        assert!(messages.iter().any(|m| m.contains("8000000000")));
    }

    #[test]
    fn test_wait_longer_than_five_years_is_rejected() {
        let workflow = manual_workflow(
            Uuid::new_v4(),
            vec![wait("pause", u32::MAX, WaitUnit::Weeks, Some("done")), end("done")],
        );
        let issues = issue_fields(&workflow);
        assert_eq!(issues, vec![(Some("pause".to_string()), "config.amount".to_string())]);

        let five_years = manual_workflow(
            Uuid::new_v4(),
            vec![wait("pause", 5 * 365, WaitUnit::Days, Some("done")), end("done")],
        );
        assert!(five_years.validate().is_empty());
    }

    #[test]
    fn test_working_hours_wait_needs_configured_hours() {
        let steps = vec![
            wait_in_working_hours("pause", 2, WaitUnit::Hours, Some("done")),
            end("done"),
        ];
        let without = manual_workflow(Uuid::new_v4(), steps.clone());
        assert!(issue_fields(&without)
            .contains(&(Some("pause".to_string()), "config.working_hours_only".to_string())));

        let with = manual_workflow(Uuid::new_v4(), steps).with_settings(WorkflowSettings {
            working_hours: Some(WorkingHours::weekdays(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            )),
            ..WorkflowSettings::default()
        });
        assert!(with.validate().is_empty());
    }

    #[test]
    fn test_settings_are_checked() {
        let workflow = manual_workflow(Uuid::new_v4(), vec![end("done")]).with_settings(WorkflowSettings {
            timezone: "Mars/Olympus".to_string(),
            enrollment_limit: Some(0),
            ..WorkflowSettings::default()
        });
        let fields: Vec<String> = workflow.validate().into_iter().map(|i| i.field).collect();
        assert!(fields.contains(&"settings.timezone".to_string()));
        assert!(fields.contains(&"settings.enrollment_limit".to_string()));
    }

    #[test]
    fn test_named_timezones_are_not_accepted() {
        let workflow = manual_workflow(Uuid::new_v4(), vec![end("done")]).with_settings(WorkflowSettings {
            timezone: "America/New_York".to_string(),
            ..WorkflowSettings::default()
        });
        let issues = workflow.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "settings.timezone");
        assert!(issues[0].message.contains("fixed offset"));
    }
}

// ============================================
// Editor documents
// ============================================

#[cfg(test)]
mod document_tests {
    use super::*;

    fn document(value: serde_json::Value) -> WorkflowDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_document_parses_into_draft_workflow() {
        let tenant_id = Uuid::new_v4();
        let workflow = Workflow::from_document(document(welcome_document(tenant_id))).unwrap();

        assert_eq!(workflow.tenant_id, tenant_id);
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.trigger.filters.len(), 1);
        assert!(matches!(workflow.steps[1].kind, StepKind::Wait(_)));
        assert!(workflow.validate().is_empty());
    }

    #[test]
    fn test_document_keeps_requested_id() {
        let id = Uuid::new_v4();
        let mut raw = welcome_document(Uuid::new_v4());
        raw["id"] = json!(id);
        let workflow = Workflow::from_document(document(raw)).unwrap();
        assert_eq!(workflow.id, id);
    }

    #[test]
    fn test_document_reports_every_bad_step() {
        let mut raw = welcome_document(Uuid::new_v4());
        raw["name"] = json!("  ");
        raw["steps"][0]["kind"]["type"] = json!("teleport");
        raw["steps"][1]["kind"]["config"]["amount"] = json!(0);

        let issues = Workflow::from_document(document(raw)).unwrap_err();
        let located: Vec<(Option<String>, String)> =
            issues.into_iter().map(|i| (i.step_id, i.field)).collect();

        assert!(located.contains(&(Some("welcome".to_string()), "kind".to_string())));
        assert!(located.contains(&(Some("pause".to_string()), "config".to_string())));
        assert!(located.contains(&(None, "name".to_string())));
    }

    #[test]
    fn test_document_with_unknown_trigger_is_rejected() {
        let mut raw = welcome_document(Uuid::new_v4());
        raw["trigger"]["event"]["type"] = json!("moon_phase");
        let issues = Workflow::from_document(document(raw)).unwrap_err();
        assert!(issues.iter().any(|i| i.step_id.is_none() && i.field == "trigger"));
    }
}
