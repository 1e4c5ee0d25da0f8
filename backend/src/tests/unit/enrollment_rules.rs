// Unit tests for enrollment admission rules

use crate::tests::fixtures::*;
use crate::tests::helpers::TestHarness;
use crate::workflows::definition::{Workflow, WorkflowSettings};
use crate::workflows::enrollments::{EnrollOutcome, EnrollmentSource, EnrollmentStatus};
use crate::workflows::store::WorkflowStore;
use crate::workflows::timing::WaitUnit;
use uuid::Uuid;

/// Manual workflow that parks every enrollment on a week-long wait
fn parking_workflow(settings: WorkflowSettings) -> Workflow {
    manual_workflow(
        Uuid::new_v4(),
        vec![wait("park", 1, WaitUnit::Weeks, Some("done")), end("done")],
    )
    .with_settings(settings)
}

fn instant_workflow(settings: WorkflowSettings) -> Workflow {
    manual_workflow(Uuid::new_v4(), vec![end("done")]).with_settings(settings)
}

#[tokio::test]
async fn test_subject_has_one_open_enrollment_per_workflow() {
    let harness = TestHarness::new();
    let workflow = harness.install(parking_workflow(WorkflowSettings::default())).await;
    let subject = Uuid::new_v4();

    let first = harness.engine.enroll_manually(workflow.id, subject).await.unwrap();
    let second = harness.engine.enroll_manually(workflow.id, subject).await.unwrap();

    let first_id = first.enrollment().unwrap().id;
    match second {
        EnrollOutcome::AlreadyEnrolled(open) => assert_eq!(open.id, first_id),
        other => panic!("expected already_enrolled, got {}", other.as_str()),
    }
    assert_eq!(harness.enrollments_of(workflow.id).await.len(), 1);
}

#[tokio::test]
async fn test_same_subject_may_join_different_workflows() {
    let harness = TestHarness::new();
    let a = harness.install(parking_workflow(WorkflowSettings::default())).await;
    let b = harness.install(parking_workflow(WorkflowSettings::default())).await;
    let subject = Uuid::new_v4();

    assert!(harness.engine.enroll_manually(a.id, subject).await.unwrap().is_enrolled());
    assert!(harness.engine.enroll_manually(b.id, subject).await.unwrap().is_enrolled());
}

#[tokio::test]
async fn test_re_enrollment_blocked_by_default() {
    let harness = TestHarness::new();
    let workflow = harness.install(instant_workflow(WorkflowSettings::default())).await;
    let subject = Uuid::new_v4();

    let finished = harness.enroll(workflow.id, subject).await;
    assert_eq!(finished.status, EnrollmentStatus::Completed);

    let again = harness.engine.enroll_manually(workflow.id, subject).await.unwrap();
    assert!(matches!(again, EnrollOutcome::ReEnrollmentBlocked));
}

#[tokio::test]
async fn test_re_enrollment_allowed_after_completion() {
    let harness = TestHarness::new();
    let workflow = harness
        .install(instant_workflow(WorkflowSettings {
            allow_re_enrollment: true,
            ..WorkflowSettings::default()
        }))
        .await;
    let subject = Uuid::new_v4();

    let first = harness.enroll(workflow.id, subject).await;
    let second = harness.enroll(workflow.id, subject).await;

    assert_ne!(first.id, second.id);
    assert_eq!(second.status, EnrollmentStatus::Completed);
    assert_eq!(harness.enrollments_of(workflow.id).await.len(), 2);
}

#[tokio::test]
async fn test_enrollment_limit_rejects_the_eleventh_subject() {
    let harness = TestHarness::new();
    let workflow = harness
        .install(parking_workflow(WorkflowSettings {
            enrollment_limit: Some(10),
            ..WorkflowSettings::default()
        }))
        .await;

    for _ in 0..10 {
        let outcome = harness.engine.enroll_manually(workflow.id, Uuid::new_v4()).await.unwrap();
        assert!(outcome.is_enrolled());
    }

    let eleventh = harness.engine.enroll_manually(workflow.id, Uuid::new_v4()).await.unwrap();
    assert!(matches!(eleventh, EnrollOutcome::LimitReached));
    assert_eq!(harness.enrollments_of(workflow.id).await.len(), 10);
}

#[tokio::test]
async fn test_enrollment_limit_frees_up_when_enrollments_end() {
    let harness = TestHarness::new();
    let workflow = harness
        .install(parking_workflow(WorkflowSettings {
            enrollment_limit: Some(1),
            allow_re_enrollment: true,
            ..WorkflowSettings::default()
        }))
        .await;

    let parked = harness.enroll(workflow.id, Uuid::new_v4()).await;
    let blocked = harness.engine.enroll_manually(workflow.id, Uuid::new_v4()).await.unwrap();
    assert!(matches!(blocked, EnrollOutcome::LimitReached));

    harness.engine.exit_enrollment(parked.id).await.unwrap();
    let admitted = harness.engine.enroll_manually(workflow.id, Uuid::new_v4()).await.unwrap();
    assert!(admitted.is_enrolled());
}

#[tokio::test]
async fn test_inactive_workflows_do_not_enroll() {
    let harness = TestHarness::new();
    let draft = parking_workflow(WorkflowSettings::default());
    harness.store.save_workflow(&draft).await.unwrap();

    let outcome = harness.engine.enroll_manually(draft.id, Uuid::new_v4()).await.unwrap();
    assert!(matches!(outcome, EnrollOutcome::WorkflowInactive));

    let active = harness.install(parking_workflow(WorkflowSettings::default())).await;
    harness.engine.pause_workflow(active.id).await.unwrap();
    let outcome = harness.engine.enroll_manually(active.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(outcome.as_str(), "workflow_inactive");
}

#[tokio::test]
async fn test_manual_enrollment_records_source_and_entry_step() {
    let harness = TestHarness::new();
    let workflow = harness.install(parking_workflow(WorkflowSettings::default())).await;

    let enrollment = harness.enroll(workflow.id, Uuid::new_v4()).await;

    assert_eq!(enrollment.source, EnrollmentSource::Manual);
    assert_eq!(enrollment.history[0].step_id, "park");
    assert_eq!(enrollment.current_step_id.as_deref(), Some("done"));
    assert!(enrollment.lease_holder.is_none());
}
