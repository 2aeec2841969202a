//! # SyncJob Repository
//!
//! Persistence of feedback sync jobs. During a run the job row is only
//! changed through [`SyncJobRepository::update_job_progress`], which applies
//! counter increments, position overwrites and bounded log appends inside a
//! single transaction.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::{Map, Value as JsonValue, json};

use crate::error::PipelineError;
use crate::models::sync_job::{
    ActiveModel, Column, Entity, JobStatus, MAX_JOB_ERRORS, MAX_JOB_LOGS, Model, SyncMode,
};

/// Parameters of a new full-sync job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFullSyncJob {
    pub days: Option<i32>,
    pub page_size: i32,
    pub max_feedbacks_per_shop: Option<i64>,
    pub total_shops: i32,
}

/// Checkpoint fields overwritten as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPosition {
    pub shop_index: i32,
    pub shop_name: String,
    pub connection_id: Option<i64>,
    pub page: i32,
    pub cursor: Option<i64>,
}

impl JobPosition {
    pub fn of(job: &Model) -> Self {
        Self {
            shop_index: job.current_shop_index,
            shop_name: job.current_shop_name.clone(),
            connection_id: job.current_connection_id,
            page: job.current_page,
            cursor: job.current_cursor,
        }
    }
}

/// One progress write. Counters are deltas; everything else overwrites
/// when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub processed: i64,
    pub synced: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub errors: i64,
    pub total_feedbacks: Option<i64>,
    pub position: Option<JobPosition>,
    pub last_processed_feedback_id: Option<i64>,
    /// Per-shop entry replacing `shop_progress[name]`
    pub shop_progress: Option<(String, JsonValue)>,
    pub log_messages: Vec<String>,
    pub error_messages: Vec<String>,
}

impl ProgressUpdate {
    pub fn log<S: Into<String>>(message: S) -> Self {
        Self {
            log_messages: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            errors: 1,
            error_messages: vec![message.into()],
            ..Self::default()
        }
    }
}

/// Repository for sync job database operations
#[derive(Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
    tz: FixedOffset,
}

impl SyncJobRepository {
    /// Log timestamps are rendered in `tz`.
    pub fn new(db: DatabaseConnection, tz: FixedOffset) -> Self {
        Self { db, tz }
    }

    pub async fn create_full(&self, params: NewFullSyncJob) -> Result<Model, DbErr> {
        let job = self.new_job(SyncMode::Full, params.page_size, params.total_shops);
        let job = ActiveModel {
            days: Set(params.days),
            max_feedbacks_per_shop: Set(params.max_feedbacks_per_shop),
            ..job
        };
        let created = job.insert(&self.db).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create full sync job");
            e
        })?;
        tracing::info!(
            job_id = created.id,
            days = ?created.days,
            page_size = created.page_size,
            "Full sync job created"
        );
        Ok(created)
    }

    pub async fn create_incremental(
        &self,
        batch_size: i32,
        total_shops: i32,
    ) -> Result<Model, DbErr> {
        let job = ActiveModel {
            batch_size: Set(batch_size),
            ..self.new_job(SyncMode::Incremental, batch_size, total_shops)
        };
        let created = job.insert(&self.db).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create incremental sync job");
            e
        })?;
        tracing::info!(
            job_id = created.id,
            batch_size,
            "Incremental sync job created"
        );
        Ok(created)
    }

    fn new_job(&self, mode: SyncMode, page_size: i32, total_shops: i32) -> ActiveModel {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: NotSet,
            sync_type: Set(mode.as_str().to_string()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            days: Set(None),
            page_size: Set(page_size),
            max_feedbacks_per_shop: Set(None),
            batch_size: Set(page_size),
            total_shops: Set(total_shops),
            current_shop_index: Set(0),
            current_shop_name: Set(String::new()),
            current_connection_id: Set(None),
            current_page: Set(1),
            current_cursor: Set(None),
            last_processed_feedback_id: Set(None),
            total_feedbacks: Set(0),
            processed_feedbacks: Set(0),
            synced_feedbacks: Set(0),
            updated_feedbacks: Set(0),
            unchanged_feedbacks: Set(0),
            error_count: Set(0),
            shop_progress: Set(json!({})),
            logs: Set(json!([])),
            errors: Set(json!([])),
            started_at: Set(None),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    pub async fn find(&self, job_id: i64) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    /// Like [`Self::find`] but a missing job is an error.
    pub async fn get(&self, job_id: i64) -> Result<Model, PipelineError> {
        self.find(job_id)
            .await?
            .ok_or(PipelineError::JobNotFound { job_id })
    }

    /// Most recently created jobs, newest first.
    pub async fn list_recent(&self, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Sets the status; `running` stamps `started_at` once, terminal states
    /// stamp `completed_at` and `pending` clears it.
    pub async fn set_status(&self, job_id: i64, status: JobStatus) -> Result<Model, PipelineError> {
        let job = self.get(job_id).await?;
        let now = Utc::now().fixed_offset();
        let started_at = job.started_at;
        let mut active: ActiveModel = job.into();
        active.status = Set(status.as_str().to_string());
        match status {
            JobStatus::Running => {
                if started_at.is_none() {
                    active.started_at = Set(Some(now));
                }
                active.completed_at = Set(None);
            }
            JobStatus::Completed | JobStatus::Failed => active.completed_at = Set(Some(now)),
            JobStatus::Pending => active.completed_at = Set(None),
            JobStatus::Paused => {}
        }
        active.updated_at = Set(now);
        let updated = active.update(&self.db).await?;
        tracing::info!(job_id, status = %status, "Sync job status changed");
        Ok(updated)
    }

    /// Applies one progress write atomically and returns the new row.
    pub async fn update_job_progress(
        &self,
        job_id: i64,
        update: ProgressUpdate,
    ) -> Result<Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let job = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(PipelineError::JobNotFound { job_id })?;

        let mut stmt = Entity::update_many()
            .col_expr(
                Column::ProcessedFeedbacks,
                Expr::col(Column::ProcessedFeedbacks).add(update.processed),
            )
            .col_expr(
                Column::SyncedFeedbacks,
                Expr::col(Column::SyncedFeedbacks).add(update.synced),
            )
            .col_expr(
                Column::UpdatedFeedbacks,
                Expr::col(Column::UpdatedFeedbacks).add(update.updated),
            )
            .col_expr(
                Column::UnchangedFeedbacks,
                Expr::col(Column::UnchangedFeedbacks).add(update.unchanged),
            )
            .col_expr(
                Column::ErrorCount,
                Expr::col(Column::ErrorCount).add(update.errors),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()));

        if let Some(total) = update.total_feedbacks {
            stmt = stmt.col_expr(Column::TotalFeedbacks, Expr::value(total));
        }
        if let Some(position) = update.position {
            stmt = stmt
                .col_expr(Column::CurrentShopIndex, Expr::value(position.shop_index))
                .col_expr(Column::CurrentShopName, Expr::value(position.shop_name))
                .col_expr(
                    Column::CurrentConnectionId,
                    Expr::value(position.connection_id),
                )
                .col_expr(Column::CurrentPage, Expr::value(position.page))
                .col_expr(Column::CurrentCursor, Expr::value(position.cursor));
        }
        if let Some(feedback_id) = update.last_processed_feedback_id {
            stmt = stmt.col_expr(
                Column::LastProcessedFeedbackId,
                Expr::value(Some(feedback_id)),
            );
        }
        if let Some((shop, entry)) = update.shop_progress {
            let mut progress = match job.shop_progress {
                JsonValue::Object(map) => map,
                _ => Map::new(),
            };
            progress.insert(shop, entry);
            stmt = stmt.col_expr(Column::ShopProgress, Expr::value(JsonValue::Object(progress)));
        }
        if !update.log_messages.is_empty() {
            let logs = push_bounded(&job.logs, &self.stamp(now, update.log_messages), MAX_JOB_LOGS);
            stmt = stmt.col_expr(Column::Logs, Expr::value(logs));
        }
        if !update.error_messages.is_empty() {
            let errors = push_bounded(
                &job.errors,
                &self.stamp(now, update.error_messages),
                MAX_JOB_ERRORS,
            );
            stmt = stmt.col_expr(Column::Errors, Expr::value(errors));
        }

        stmt.filter(Column::Id.eq(job_id)).exec(&txn).await?;
        let updated = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(PipelineError::JobNotFound { job_id })?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Moves the job back to the first shop. Unless `keep_page_cursor` is
    /// set, the page, cursor and per-shop positions are cleared as well.
    pub async fn reset_shop_index(
        &self,
        job_id: i64,
        keep_page_cursor: bool,
    ) -> Result<Model, PipelineError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;
        let job = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(PipelineError::JobNotFound { job_id })?;

        let message = if keep_page_cursor {
            "Shop index reset to 0 (page and cursor kept)"
        } else {
            "Shop index reset to 0; page and cursor cleared"
        };
        let logs = push_bounded(&job.logs, &self.stamp(now, vec![message.to_string()]), MAX_JOB_LOGS);

        let mut active: ActiveModel = job.into();
        active.current_shop_index = Set(0);
        if !keep_page_cursor {
            active.current_page = Set(1);
            active.current_cursor = Set(None);
            active.current_shop_name = Set(String::new());
            active.current_connection_id = Set(None);
            active.shop_progress = Set(json!({}));
        }
        active.logs = Set(logs);
        active.updated_at = Set(now.fixed_offset());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        tracing::info!(job_id, keep_page_cursor, "Sync job shop index reset");
        Ok(updated)
    }

    fn stamp(&self, now: DateTime<Utc>, messages: Vec<String>) -> Vec<String> {
        let prefix = now.with_timezone(&self.tz).format("%H:%M:%S").to_string();
        messages
            .into_iter()
            .map(|m| format!("[{prefix}] {m}"))
            .collect()
    }
}

/// Appends `new` to a JSON string list and keeps the newest `max` entries.
fn push_bounded(current: &JsonValue, new: &[String], max: usize) -> JsonValue {
    let mut items: Vec<JsonValue> = current.as_array().cloned().unwrap_or_default();
    items.extend(new.iter().cloned().map(JsonValue::String));
    if items.len() > max {
        items.drain(..items.len() - max);
    }
    JsonValue::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_bounded_keeps_newest() {
        let current = json!(["a", "b", "c"]);
        let out = push_bounded(&current, &["d".to_string(), "e".to_string()], 4);
        assert_eq!(out, json!(["b", "c", "d", "e"]));
    }

    #[test]
    fn push_bounded_tolerates_non_list() {
        let out = push_bounded(&JsonValue::Null, &["x".to_string()], 10);
        assert_eq!(out, json!(["x"]));
    }
}
