use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nurture_shared::EnrollmentStatusCounts;
use serde::de::DeserializeOwned;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{EnrollmentStore, WorkflowStore};
use crate::workflows::definition::Workflow;
use crate::workflows::enrollments::{Enrollment, EnrollmentStatus};
use crate::workflows::errors::StoreError;

const ENROLLMENT_COLUMNS: &str = r#"
    id, workflow_id, tenant_id, subject_id, status, current_step_id, current_step_index,
    attempt, enrolled_at, next_step_at, completed_at, exited_at, failure_reason, last_error,
    split_choices, history, exit_requested, lease_holder, lease_expires_at, source
"#;

#[derive(Debug, FromRow)]
struct WorkflowRow {
    document: serde_json::Value,
    version: i64,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow, StoreError> {
        let mut workflow: Workflow = serde_json::from_value(self.document)?;
        workflow.version = self.version;
        Ok(workflow)
    }
}

#[derive(Debug, FromRow)]
struct EnrollmentRow {
    id: Uuid,
    workflow_id: Uuid,
    tenant_id: Uuid,
    subject_id: Uuid,
    status: String,
    current_step_id: Option<String>,
    current_step_index: i64,
    attempt: i32,
    enrolled_at: DateTime<Utc>,
    next_step_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    exited_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    last_error: Option<String>,
    split_choices: serde_json::Value,
    history: serde_json::Value,
    exit_requested: bool,
    lease_holder: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    source: String,
}

/// Status-like columns are stored as their snake_case serde names
fn from_text<T: DeserializeOwned>(value: String) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(value))?)
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        Ok(Enrollment {
            id: row.id,
            workflow_id: row.workflow_id,
            tenant_id: row.tenant_id,
            subject_id: row.subject_id,
            status: from_text(row.status)?,
            current_step_id: row.current_step_id,
            current_step_index: row.current_step_index,
            attempt: row.attempt.max(0) as u32,
            enrolled_at: row.enrolled_at,
            next_step_at: row.next_step_at,
            completed_at: row.completed_at,
            exited_at: row.exited_at,
            failure_reason: row.failure_reason.map(from_text).transpose()?,
            last_error: row.last_error,
            split_choices: serde_json::from_value::<HashMap<String, String>>(row.split_choices)?,
            history: serde_json::from_value(row.history)?,
            exit_requested: row.exit_requested,
            lease_holder: row.lease_holder,
            lease_expires_at: row.lease_expires_at,
            source: from_text(row.source)?,
        })
    }
}

fn to_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

pub struct PgAutomationStore {
    pool: PgPool,
}

impl PgAutomationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_enrollment(&self, sql: &str, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let row: Option<EnrollmentRow> = sqlx::query_as(sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(Enrollment::try_from).transpose()
    }
}

#[async_trait]
impl WorkflowStore for PgAutomationStore {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> =
            sqlx::query_as("SELECT document, version FROM automation_workflows WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(WorkflowRow::into_workflow).transpose()
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let document = serde_json::to_value(workflow)?;

        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO automation_workflows (id, tenant_id, status, document, version, created_at)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                document = EXCLUDED.document,
                version = automation_workflows.version + 1,
                updated_at = NOW()
            RETURNING version
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(workflow.status.as_str())
        .bind(document)
        .bind(workflow.created_at)
        .fetch_one(&self.pool)
        .await?;

        let mut stored = workflow.clone();
        stored.version = version;
        Ok(stored)
    }

    async fn list_active_workflows(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workflow>, StoreError> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT document, version FROM automation_workflows
            WHERE status = 'active' AND ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }
}

#[async_trait]
impl EnrollmentStore for PgAutomationStore {
    async fn insert_enrollment(&self, e: &Enrollment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO automation_enrollments (
                id, workflow_id, tenant_id, subject_id, status, current_step_id, current_step_index,
                attempt, enrolled_at, next_step_at, split_choices, history, exit_requested,
                lease_holder, lease_expires_at, source
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(e.id)
        .bind(e.workflow_id)
        .bind(e.tenant_id)
        .bind(e.subject_id)
        .bind(e.status.as_str())
        .bind(&e.current_step_id)
        .bind(e.current_step_index)
        .bind(e.attempt as i32)
        .bind(e.enrolled_at)
        .bind(e.next_step_at)
        .bind(serde_json::to_value(&e.split_choices)?)
        .bind(serde_json::to_value(&e.history)?)
        .bind(e.exit_requested)
        .bind(e.lease_holder)
        .bind(e.lease_expires_at)
        .bind(to_text(&e.source)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict(format!(
                "subject {} already enrolled in workflow {}",
                e.subject_id, e.workflow_id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let sql = format!("SELECT {} FROM automation_enrollments WHERE id = $1", ENROLLMENT_COLUMNS);
        self.fetch_enrollment(&sql, id).await
    }

    async fn find_open_enrollment(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM automation_enrollments
            WHERE workflow_id = $1 AND subject_id = $2 AND status IN ('active', 'paused')
            "#,
            ENROLLMENT_COLUMNS
        );
        let row: Option<EnrollmentRow> = sqlx::query_as(&sql)
            .bind(workflow_id)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Enrollment::try_from).transpose()
    }

    async fn has_terminal_enrollment(&self, workflow_id: Uuid, subject_id: Uuid) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM automation_enrollments
                WHERE workflow_id = $1 AND subject_id = $2
                  AND status IN ('completed', 'exited', 'failed')
            )
            "#,
        )
        .bind(workflow_id)
        .bind(subject_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn count_active(&self, workflow_id: Uuid) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM automation_enrollments WHERE workflow_id = $1 AND status = 'active'",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn status_counts(&self, workflow_id: Uuid) -> Result<EnrollmentStatusCounts, StoreError> {
        let counts = sqlx::query_as::<_, EnrollmentStatusCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'paused') AS paused,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'exited') AS exited,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
            FROM automation_enrollments
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn list_enrollments(
        &self,
        workflow_id: Uuid,
        status: Option<EnrollmentStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Enrollment>, i64), StoreError> {
        let status = status.map(|s| s.as_str());

        let sql = format!(
            r#"
            SELECT {} FROM automation_enrollments
            WHERE workflow_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY enrolled_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            ENROLLMENT_COLUMNS
        );
        let rows: Vec<EnrollmentRow> = sqlx::query_as(&sql)
            .bind(workflow_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM automation_enrollments WHERE workflow_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(workflow_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let enrollments = rows
            .into_iter()
            .map(Enrollment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((enrollments, total))
    }

    async fn due_enrollments(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM automation_enrollments
            WHERE (lease_holder IS NULL OR lease_expires_at <= $1)
              AND (
                (status = 'active' AND (exit_requested OR next_step_at IS NULL OR next_step_at <= $1))
                OR (status = 'paused' AND exit_requested)
              )
            ORDER BY COALESCE(next_step_at, enrolled_at)
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, StoreError> {
        let sql = format!(
            r#"
            UPDATE automation_enrollments
            SET lease_holder = $2, lease_expires_at = $3
            WHERE id = $1 AND (lease_holder IS NULL OR lease_expires_at <= $4)
            RETURNING {}
            "#,
            ENROLLMENT_COLUMNS
        );
        let row: Option<EnrollmentRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(holder)
            .bind(until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                let (exists,): (bool,) =
                    sqlx::query_as("SELECT EXISTS (SELECT 1 FROM automation_enrollments WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&self.pool)
                        .await?;
                if exists { Ok(None) } else { Err(StoreError::NotFound(id)) }
            }
        }
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET lease_expires_at = GREATEST($3, $4)
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(id));
        }
        Ok(())
    }

    async fn save_leased(&self, e: &Enrollment, holder: Uuid) -> Result<(), StoreError> {
        let failure_reason = e.failure_reason.as_ref().map(to_text).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET status = $3,
                current_step_id = $4,
                current_step_index = $5,
                attempt = $6,
                next_step_at = $7,
                completed_at = $8,
                exited_at = $9,
                failure_reason = $10,
                last_error = $11,
                split_choices = $12,
                history = $13,
                updated_at = NOW()
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(e.id)
        .bind(holder)
        .bind(e.status.as_str())
        .bind(&e.current_step_id)
        .bind(e.current_step_index)
        .bind(e.attempt as i32)
        .bind(e.next_step_at)
        .bind(e.completed_at)
        .bind(e.exited_at)
        .bind(failure_reason)
        .bind(&e.last_error)
        .bind(serde_json::to_value(&e.split_choices)?)
        .bind(serde_json::to_value(&e.history)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(e.id));
        }
        Ok(())
    }

    async fn release_lease(&self, id: Uuid, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET lease_holder = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_exit(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE automation_enrollments SET exit_requested = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn is_exit_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let flag: Option<(bool,)> =
            sqlx::query_as("SELECT exit_requested FROM automation_enrollments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.is_some_and(|(f,)| f))
    }

    async fn record_date_trigger_run(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
        qualifying_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO automation_date_trigger_runs (workflow_id, subject_id, qualifying_date)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(subject_id)
        .bind(qualifying_date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
