//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the feedback_sync_jobs
//! table. A job row is the single source of truth for resuming a crawl.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// Newest log lines retained on a job.
pub const MAX_JOB_LOGS: usize = 1000;

/// Newest error lines retained on a job.
pub const MAX_JOB_ERRORS: usize = 500;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "feedback_sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// `full` or `incremental`
    pub sync_type: String,

    /// One of pending, running, paused, completed, failed
    pub status: String,

    /// Look-back window in days for full syncs (`None` = unbounded)
    pub days: Option<i32>,

    pub page_size: i32,
    pub max_feedbacks_per_shop: Option<i64>,
    pub batch_size: i32,

    pub total_shops: i32,
    pub current_shop_index: i32,
    pub current_shop_name: String,
    pub current_connection_id: Option<i64>,

    /// Next page to request for the current shop
    pub current_page: i32,

    /// `comment_id` of the last item of the previous page
    pub current_cursor: Option<i64>,

    pub last_processed_feedback_id: Option<i64>,

    pub total_feedbacks: i64,
    pub processed_feedbacks: i64,
    pub synced_feedbacks: i64,
    pub updated_feedbacks: i64,
    pub unchanged_feedbacks: i64,
    pub error_count: i64,

    /// Per-shop counters keyed by shop name
    #[sea_orm(column_type = "JsonBinary")]
    pub shop_progress: JsonValue,

    /// Rolling log lines, oldest first
    #[sea_orm(column_type = "JsonBinary")]
    pub logs: JsonValue,

    /// Rolling error lines, oldest first
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn mode(&self) -> Option<SyncMode> {
        self.sync_type.parse().ok()
    }

    /// Share of processed feedbacks over the probed total, in percent.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_feedbacks <= 0 {
            return 0.0;
        }
        (self.processed_feedbacks as f64 / self.total_feedbacks as f64) * 100.0
    }

    pub fn log_lines(&self) -> Vec<String> {
        string_list(&self.logs)
    }

    pub fn error_lines(&self) -> Vec<String> {
        string_list(&self.errors)
    }
}

fn string_list(value: &JsonValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle state of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Crawl strategy of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}
