// Scheduler passes: date triggers, job runs and enrollment listings

use crate::jobs::{JobConfig, JobScheduler, JobStatus};
use crate::pagination::PageRequest;
use crate::tests::fixtures::*;
use crate::tests::helpers::{test_epoch, TestHarness};
use crate::workflows::definition::WorkflowSettings;
use crate::workflows::enrollments::{EnrollmentSource, EnrollmentStatus};
use crate::workflows::scheduler::DatePassReport;
use crate::workflows::timing::WaitUnit;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

fn ten_am() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap()
}

fn birthday(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, month, day).unwrap()
}

// ============================================
// Date-based triggers
// ============================================

#[cfg(test)]
mod date_trigger_tests {
    use super::*;

    #[tokio::test]
    async fn test_birthday_fires_once_at_run_time() {
        let harness = TestHarness::new();
        let tenant_id = Uuid::new_v4();
        let workflow = harness
            .install(birthday_workflow(tenant_id, ten_am(), vec![send_email("greet", "birthday", None)]))
            .await;
        let subject = Uuid::new_v4();
        harness.crm.set_date(tenant_id, subject, "birthday", birthday(3, 4));
        harness.crm.set_date(tenant_id, Uuid::new_v4(), "birthday", birthday(7, 19));

        // 09:00, before the run time
        let early = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(early.workflows_evaluated, 0);

        harness.clock.advance(Duration::hours(1));
        let report = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(report.workflows_evaluated, 1);
        assert_eq!(report.subjects_matched, 1);
        assert_eq!(report.enrolled, 1);
        assert_eq!(harness.crm.messages_to(subject), 1);

        let enrollments = harness.enrollments_of(workflow.id).await;
        assert_eq!(enrollments.len(), 1);
        assert_eq!(enrollments[0].source, EnrollmentSource::DateTrigger);
        assert_eq!(enrollments[0].status, EnrollmentStatus::Completed);

        // Later passes the same day do nothing
        harness.clock.advance(Duration::hours(3));
        let again = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(again.workflows_evaluated, 0);
        assert_eq!(harness.crm.messages_to(subject), 1);
    }

    #[tokio::test]
    async fn test_yearly_trigger_fires_again_next_year() {
        let harness = TestHarness::new();
        let tenant_id = Uuid::new_v4();
        let workflow = harness
            .install(birthday_workflow(tenant_id, ten_am(), vec![send_email("greet", "birthday", None)]))
            .await;
        let subject = Uuid::new_v4();
        harness.crm.set_date(tenant_id, subject, "birthday", birthday(3, 4));

        harness.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap());
        harness.engine.run_date_trigger_pass().await.unwrap();

        // Next day: evaluated, nobody qualifies
        harness.clock.advance(Duration::days(1));
        let next_day = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(next_day.workflows_evaluated, 1);
        assert_eq!(next_day.subjects_matched, 0);

        harness.clock.set(Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap());
        let next_year = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(next_year.enrolled, 1);

        assert_eq!(harness.crm.messages_to(subject), 2);
        assert_eq!(harness.enrollments_of(workflow.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_run_time_is_read_in_workflow_timezone() {
        let harness = TestHarness::new();
        let tenant_id = Uuid::new_v4();
        let workflow = birthday_workflow(tenant_id, ten_am(), vec![end("done")]).with_settings(WorkflowSettings {
            allow_re_enrollment: true,
            timezone: "-05:00".to_string(),
            ..WorkflowSettings::default()
        });
        harness.install(workflow).await;
        harness.crm.set_date(tenant_id, Uuid::new_v4(), "birthday", birthday(3, 4));

        // 14:00 UTC is 09:00 local
        harness.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 14, 0, 0).unwrap());
        let early = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(early.workflows_evaluated, 0);

        harness.clock.advance(Duration::hours(1));
        let on_time = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(on_time.enrolled, 1);
    }

    #[tokio::test]
    async fn test_subject_already_in_flight_is_not_enrolled_twice() {
        let harness = TestHarness::new();
        let tenant_id = Uuid::new_v4();
        let workflow = harness
            .install(birthday_workflow(
                tenant_id,
                ten_am(),
                vec![wait("linger", 2, WaitUnit::Weeks, Some("done")), end("done")],
            ))
            .await;
        let subject = Uuid::new_v4();
        harness.crm.set_date(tenant_id, subject, "birthday", birthday(3, 4));
        harness.crm.set_date(tenant_id, subject, "birthday", birthday(3, 5));

        harness.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap());
        harness.engine.run_date_trigger_pass().await.unwrap();
        harness.clock.advance(Duration::days(1));
        let second = harness.engine.run_date_trigger_pass().await.unwrap();

        assert_eq!(second.subjects_matched, 1);
        assert_eq!(second.enrolled, 0);
        assert_eq!(harness.enrollments_of(workflow.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_only_date_workflows_are_evaluated() {
        let harness = TestHarness::new();
        harness.install(lead_nurture(Uuid::new_v4())).await;
        harness.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap());

        let report = harness.engine.run_date_trigger_pass().await.unwrap();
        assert_eq!(report, DatePassReport::default());
    }
}

// ============================================
// Wake-up passes
// ============================================

#[cfg(test)]
mod wake_pass_tests {
    use super::*;
    use crate::workflows::store::EnrollmentStore;

    #[tokio::test]
    async fn test_one_failing_wake_up_does_not_stop_the_batch() {
        let harness = TestHarness::new();
        let workflow = harness
            .install(manual_workflow(
                Uuid::new_v4(),
                vec![
                    wait("pause", 1, WaitUnit::Hours, Some("send")),
                    send_email("send", "follow-up", None),
                ],
            ))
            .await;
        let (unlucky, lucky) = (Uuid::new_v4(), Uuid::new_v4());
        let lost = harness.enroll(workflow.id, unlucky).await;
        let kept = harness.enroll(workflow.id, lucky).await;
        harness.clock.advance(Duration::hours(1));
        harness.crm.delay_messages(std::time::Duration::from_millis(300));

        // Another worker takes one lease mid-send, so that wake-up errors out
        let steal = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let later = test_epoch() + Duration::hours(2);
            harness
                .store
                .try_acquire_lease(lost.id, Uuid::new_v4(), later + Duration::minutes(5), later)
                .await
                .unwrap()
                .unwrap();
        };
        let (report, _) = tokio::join!(harness.engine.run_due_pass(), steal);
        let report = report.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(harness.enrollment(kept.id).await.status, EnrollmentStatus::Completed);
        assert_eq!(harness.crm.messages_to(lucky), 1);
    }
}

// ============================================
// Scheduled jobs
// ============================================

#[cfg(test)]
mod job_tests {
    use super::*;

    #[tokio::test]
    async fn test_wake_up_job_drives_due_enrollments() {
        let harness = TestHarness::new();
        let workflow = harness.install(lead_nurture(Uuid::new_v4())).await;
        let subject = Uuid::new_v4();
        harness.enroll(workflow.id, subject).await;
        let jobs = JobScheduler::new(harness.engine.clone(), JobConfig::default())
            .await
            .unwrap();

        let idle = jobs.run_job_now("enrollment_wake_up").await.unwrap();
        assert_eq!(idle.items_processed, 0);

        harness.clock.advance(Duration::days(1));
        let log = jobs.run_job_now("enrollment_wake_up").await.unwrap();
        assert_eq!(log.status, JobStatus::Completed);
        assert_eq!(log.items_processed, 1);
        assert!(log.errors.is_empty());
        assert_eq!(harness.crm.messages_to(subject), 1);
    }

    #[tokio::test]
    async fn test_date_job_reports_matched_subjects() {
        let harness = TestHarness::new();
        let tenant_id = Uuid::new_v4();
        harness
            .install(birthday_workflow(tenant_id, ten_am(), vec![end("done")]))
            .await;
        for _ in 0..3 {
            harness.crm.set_date(tenant_id, Uuid::new_v4(), "birthday", birthday(3, 4));
        }
        harness.clock.set(test_epoch() + Duration::hours(2));
        let jobs = JobScheduler::new(harness.engine.clone(), JobConfig::default())
            .await
            .unwrap();

        let log = jobs.run_job_now("date_triggers").await.unwrap();
        assert_eq!(log.items_processed, 3);
        assert_eq!(jobs.get_execution_logs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let harness = TestHarness::new();
        let config = JobConfig {
            wake_up_interval_secs: 0,
            ..JobConfig::default()
        };
        assert!(JobScheduler::new(harness.engine.clone(), config).await.is_err());
    }
}

// ============================================
// Enrollment listings
// ============================================

#[cfg(test)]
mod listing_tests {
    use super::*;

    #[tokio::test]
    async fn test_enrollments_are_paged_with_status_counts() {
        let harness = TestHarness::new();
        let workflow = harness
            .install(
                manual_workflow(
                    Uuid::new_v4(),
                    vec![wait("park", 1, WaitUnit::Days, Some("done")), end("done")],
                )
                .with_settings(WorkflowSettings {
                    allow_re_enrollment: true,
                    ..WorkflowSettings::default()
                }),
            )
            .await;

        let mut ids = Vec::new();
        for _ in 0..23 {
            ids.push(harness.enroll(workflow.id, Uuid::new_v4()).await.id);
        }
        harness.engine.exit_enrollment(ids[0]).await.unwrap();
        harness.engine.pause_enrollment(ids[1]).await.unwrap();

        let page = harness
            .engine
            .list_enrollments(workflow.id, None, &PageRequest::new(3, 10))
            .await
            .unwrap();
        assert_eq!(page.total, 23);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 3);
        assert_eq!(page.enrollments.len(), 3);
        assert_eq!(page.counts.active, 21);
        assert_eq!(page.counts.paused, 1);
        assert_eq!(page.counts.exited, 1);
        assert_eq!(page.counts.total, 23);

        let exited = harness
            .engine
            .list_enrollments(workflow.id, Some(EnrollmentStatus::Exited), &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(exited.total, 1);
        assert_eq!(exited.enrollments[0].id, ids[0]);
        assert_eq!(exited.enrollments[0].status, "exited");
    }

    #[tokio::test]
    async fn test_listing_unknown_workflow_fails() {
        let harness = TestHarness::new();
        let result = harness
            .engine
            .list_enrollments(Uuid::new_v4(), None, &PageRequest::default())
            .await;
        assert!(result.is_err());
    }
}
