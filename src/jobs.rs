//! # Job Control Plane
//!
//! Operator commands over persisted sync jobs: creation, resume gating,
//! shop index resets, re-aligning a crashed job's page/cursor, and the
//! status report printed by the CLI.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::seller::MAX_PAGE_SIZE;
use crate::clients::{RatingsQuery, SellerApi};
use crate::cursor::{PageCursor, parse_debug_log, parse_progress_line};
use crate::error::PipelineError;
use crate::models::sync_job::{JobStatus, Model as SyncJob, SyncMode};
use crate::repositories::feedback::FeedbackStore;
use crate::repositories::sync_job::{JobPosition, NewFullSyncJob, ProgressUpdate, SyncJobRepository};
use crate::shops::ShopRegistry;
use crate::sync::full::{ShopProgress, full_window};
use crate::sync::{Pacer, PipelineSettings, RetryPolicy, fetch_with_retry};

/// Pages crawled by [`ResumeStrategy::FromFeedbackId`] before giving up.
pub const FEEDBACK_SEARCH_MAX_PAGES: u32 = 1000;

const STATUS_LOG_LINES: usize = 50;
const STATUS_ERROR_LINES: usize = 20;

/// How `update_resume_position` finds the new `(page, cursor)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Set verbatim
    Manual { page: u32, cursor: i64 },
    /// Crawl the current shop from page 1 until this id (or the newest
    /// stored one) shows up
    FromFeedbackId(Option<i64>),
    /// `page_number=N&cursor=C` from a request log; continues at `N+1`
    FromDebugLog(String),
    /// Like `FromDebugLog` when a line is given, otherwise the newest
    /// progress line in the job's logs
    FromLogs(Option<String>),
}

impl ResumeStrategy {
    pub const fn name(&self) -> &'static str {
        match self {
            ResumeStrategy::Manual { .. } => "manual",
            ResumeStrategy::FromFeedbackId(_) => "from_feedback_id",
            ResumeStrategy::FromDebugLog(_) => "from_debug_log",
            ResumeStrategy::FromLogs(_) => "from_logs",
        }
    }
}

/// Read-only estimate of where a job would continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeEstimate {
    pub job_id: i64,
    pub connection_id: i64,
    pub total_reviews: u64,
    /// `total_reviews` was counted from the store rather than given
    pub counted_from_store: bool,
    pub page_size: u32,
    pub estimated_page: u32,
    pub estimated_cursor: Option<i64>,
}

impl fmt::Display for ResumeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job {} (connection {})", self.job_id, self.connection_id)?;
        writeln!(
            f,
            "  reviews: {}{}",
            self.total_reviews,
            if self.counted_from_store {
                " (stored)"
            } else {
                ""
            }
        )?;
        writeln!(f, "  page size: {}", self.page_size)?;
        writeln!(f, "  estimated page: {}", self.estimated_page)?;
        match self.estimated_cursor {
            Some(cursor) => write!(f, "  estimated cursor: {cursor}"),
            None => write!(f, "  estimated cursor: none"),
        }
    }
}

/// Job report printed after every CLI command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: i64,
    pub sync_type: String,
    pub status: String,
    pub progress_percentage: f64,
    pub total_feedbacks: i64,
    pub processed_feedbacks: i64,
    pub synced_feedbacks: i64,
    pub updated_feedbacks: i64,
    pub unchanged_feedbacks: i64,
    pub error_count: i64,
    pub current_shop_index: i32,
    pub total_shops: i32,
    pub current_shop_name: String,
    pub current_connection_id: Option<i64>,
    pub current_page: i32,
    pub current_cursor: Option<i64>,
    pub last_processed_feedback_id: Option<i64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Newest log lines, oldest first
    pub recent_logs: Vec<String>,
    pub recent_errors: Vec<String>,
}

impl From<&SyncJob> for JobStatusView {
    fn from(job: &SyncJob) -> Self {
        Self {
            job_id: job.id,
            sync_type: job.sync_type.clone(),
            status: job.status.clone(),
            progress_percentage: job.progress_percentage(),
            total_feedbacks: job.total_feedbacks,
            processed_feedbacks: job.processed_feedbacks,
            synced_feedbacks: job.synced_feedbacks,
            updated_feedbacks: job.updated_feedbacks,
            unchanged_feedbacks: job.unchanged_feedbacks,
            error_count: job.error_count,
            current_shop_index: job.current_shop_index,
            total_shops: job.total_shops,
            current_shop_name: job.current_shop_name.clone(),
            current_connection_id: job.current_connection_id,
            current_page: job.current_page,
            current_cursor: job.current_cursor,
            last_processed_feedback_id: job.last_processed_feedback_id,
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            recent_logs: tail(job.log_lines(), STATUS_LOG_LINES),
            recent_errors: tail(job.error_lines(), STATUS_ERROR_LINES),
        }
    }
}

impl fmt::Display for JobStatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Job {} [{}] {} - {:.1}%",
            self.job_id, self.sync_type, self.status, self.progress_percentage
        )?;
        writeln!(
            f,
            "  processed {}/{}: {} synced, {} updated, {} unchanged, {} errors",
            self.processed_feedbacks,
            self.total_feedbacks,
            self.synced_feedbacks,
            self.updated_feedbacks,
            self.unchanged_feedbacks,
            self.error_count
        )?;
        writeln!(
            f,
            "  shop {}/{} '{}' (connection {}), page {}, cursor {}",
            self.current_shop_index,
            self.total_shops,
            self.current_shop_name,
            self.current_connection_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            self.current_page,
            self.current_cursor
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        )?;
        if let Some(started) = &self.started_at {
            writeln!(f, "  started {started}")?;
        }
        if let Some(completed) = &self.completed_at {
            writeln!(f, "  completed {completed}")?;
        }
        if !self.recent_logs.is_empty() {
            writeln!(f, "  logs:")?;
            for line in &self.recent_logs {
                writeln!(f, "    {line}")?;
            }
        }
        if !self.recent_errors.is_empty() {
            writeln!(f, "  errors:")?;
            for line in &self.recent_errors {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}

fn tail(mut lines: Vec<String>, n: usize) -> Vec<String> {
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    lines
}

pub struct JobControl {
    jobs: SyncJobRepository,
    store: FeedbackStore,
    registry: Arc<ShopRegistry>,
    seller: Arc<dyn SellerApi>,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl JobControl {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<ShopRegistry>,
        seller: Arc<dyn SellerApi>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            jobs: SyncJobRepository::new(db.clone(), settings.tz),
            store: FeedbackStore::new(db),
            registry,
            seller,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` while crawling for a feedback id.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn jobs(&self) -> &SyncJobRepository {
        &self.jobs
    }

    pub async fn create_full_sync(
        &self,
        days: Option<i32>,
        page_size: u32,
        per_shop_cap: Option<i64>,
    ) -> Result<SyncJob, PipelineError> {
        if page_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "page size must be positive".to_string(),
            ));
        }
        if per_shop_cap.is_some_and(|cap| cap < 0) {
            return Err(PipelineError::InvalidArgument(
                "per-shop cap must not be negative".to_string(),
            ));
        }
        let job = self
            .jobs
            .create_full(NewFullSyncJob {
                days,
                page_size: page_size.min(MAX_PAGE_SIZE) as i32,
                max_feedbacks_per_shop: per_shop_cap,
                total_shops: self.registry.len() as i32,
            })
            .await?;
        Ok(job)
    }

    pub async fn create_incremental_sync(&self, batch_size: u32) -> Result<SyncJob, PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "batch size must be positive".to_string(),
            ));
        }
        let job = self
            .jobs
            .create_incremental(
                batch_size.min(MAX_PAGE_SIZE) as i32,
                self.registry.len() as i32,
            )
            .await?;
        Ok(job)
    }

    /// Makes a job runnable again, keeping all of its progress. Pending jobs
    /// are returned as they are; completed jobs need a cursor to resume from.
    pub async fn resume(&self, job_id: i64) -> Result<SyncJob, PipelineError> {
        let job = self.jobs.get(job_id).await?;
        let refuse = |job: &SyncJob| PipelineError::InvalidJobState {
            job_id,
            status: job.status.clone(),
            action: "resume",
        };
        match job.job_status() {
            Some(JobStatus::Pending) => return Ok(job),
            Some(JobStatus::Paused | JobStatus::Failed) => {}
            Some(JobStatus::Completed) if job.current_cursor.is_some() => {}
            _ => return Err(refuse(&job)),
        }

        let from = job.status.clone();
        self.jobs
            .update_job_progress(
                job_id,
                ProgressUpdate::log(format!(
                    "Resumed from {from} at shop {} page {}",
                    job.current_shop_index, job.current_page
                )),
            )
            .await?;
        let job = self.jobs.set_status(job_id, JobStatus::Pending).await?;
        info!(job_id, from = %from, "Sync job resumed");
        Ok(job)
    }

    pub async fn reset_shop_index(
        &self,
        job_id: i64,
        keep_page_cursor: bool,
    ) -> Result<SyncJob, PipelineError> {
        self.jobs.reset_shop_index(job_id, keep_page_cursor).await
    }

    /// Re-aligns the job's current shop on a new `(page, cursor)` and
    /// reopens that shop for the next run.
    pub async fn update_resume_position(
        &self,
        job_id: i64,
        strategy: ResumeStrategy,
    ) -> Result<SyncJob, PipelineError> {
        let job = self.jobs.get(job_id).await?;
        let position = match &strategy {
            ResumeStrategy::Manual { page, cursor } => {
                if *page == 0 || *page > i32::MAX as u32 {
                    return Err(PipelineError::InvalidArgument(format!(
                        "page must be between 1 and {}",
                        i32::MAX
                    )));
                }
                PageCursor::resume_at(*page, Some(*cursor))
            }
            ResumeStrategy::FromDebugLog(line) => parse_debug_log(line)?.continuation(),
            ResumeStrategy::FromLogs(Some(line)) => parse_debug_log(line)?.continuation(),
            ResumeStrategy::FromLogs(None) => position_from_logs(&job)?,
            ResumeStrategy::FromFeedbackId(feedback_id) => {
                self.position_from_feedback(&job, *feedback_id).await?
            }
        };

        let mut update = ProgressUpdate::log(format!(
            "Resume position set by {}: page {} cursor {}",
            strategy.name(),
            position.page_number,
            position.cursor
        ));
        let mut target = JobPosition::of(&job);
        target.page = position.page_number as i32;
        target.cursor = position.stored_cursor();

        // A job interrupted before its first commit has no current
        // connection yet; its shop is the one at `current_shop_index`.
        let shops = self.registry.list_shops();
        let resolved = match job.current_connection_id {
            Some(connection_id) => self.registry.position(connection_id),
            None => usize::try_from(job.current_shop_index)
                .ok()
                .filter(|index| *index < shops.len()),
        };
        if let Some(index) = resolved {
            target.shop_index = index as i32;
            target.shop_name = shops[index].name.clone();
            target.connection_id = Some(shops[index].connection_id);
        }

        if let Some(connection_id) = target.connection_id
            && job.mode() == Some(SyncMode::Full)
            && !target.shop_name.is_empty()
        {
            let mut progress = job
                .shop_progress
                .get(&target.shop_name)
                .and_then(|entry| ShopProgress::restore(entry, connection_id))
                .unwrap_or_else(|| ShopProgress::new(connection_id));
            progress.set_position(&position);
            progress.done = false;
            progress.consecutive_failures = 0;
            update.shop_progress = Some((target.shop_name.clone(), progress.to_json()?));
        }
        update.position = Some(target);

        let updated = self.jobs.update_job_progress(job_id, update).await?;
        info!(
            job_id,
            method = strategy.name(),
            page = position.page_number,
            cursor = position.cursor,
            "Sync job resume position updated"
        );
        Ok(updated)
    }

    /// Crawls the job's current shop from the first page until `feedback_id`
    /// (or the newest stored feedback of that shop) is seen on page N, and
    /// returns the position continuing after page N.
    async fn position_from_feedback(
        &self,
        job: &SyncJob,
        feedback_id: Option<i64>,
    ) -> Result<PageCursor, PipelineError> {
        let connection_id = require_connection(job)?;
        let feedback_id = match feedback_id {
            Some(id) => id,
            None => self
                .store
                .latest_for_connection(connection_id)
                .await?
                .map(|feedback| feedback.feedback_id)
                .ok_or_else(|| {
                    PipelineError::InvalidArgument(format!(
                        "no stored feedback for connection {connection_id}"
                    ))
                })?,
        };

        let window = full_window(job.days, Utc::now().with_timezone(&self.settings.tz));
        let page_size = job.page_size.clamp(1, MAX_PAGE_SIZE as i32) as u32;
        let policy = RetryPolicy::from_config(&self.settings.sync);
        let mut pacer = Pacer::new(Duration::from_millis(self.settings.sync.inter_page_delay_ms));
        let mut position = PageCursor::first();

        while position.page_number <= FEEDBACK_SEARCH_MAX_PAGES {
            pacer.wait(&self.cancel).await?;
            let query = RatingsQuery::at(
                connection_id,
                window,
                &position,
                page_size,
                &self.settings.language,
            );
            let page = fetch_with_retry(self.seller.as_ref(), &query, policy, &self.cancel).await?;
            if page.items.is_empty() {
                break;
            }
            let last_comment_id = page.last_comment_id();
            if page.comment_ids().contains(&feedback_id) {
                info!(
                    job_id = job.id,
                    feedback_id,
                    page = position.page_number,
                    "Feedback located"
                );
                position.advance(last_comment_id);
                return Ok(position);
            }
            position.advance(last_comment_id);
        }

        Err(PipelineError::InvalidArgument(format!(
            "feedback {feedback_id} not found within {} pages of connection {connection_id}",
            position.page_number - 1
        )))
    }

    /// Where the job would continue if the current shop's stored reviews
    /// were all fetched in order. Does not modify the job.
    pub async fn estimate_resume_position(
        &self,
        job_id: i64,
        total_reviews: Option<u64>,
        page_size: u32,
    ) -> Result<ResumeEstimate, PipelineError> {
        if page_size == 0 {
            return Err(PipelineError::InvalidArgument(
                "page size must be positive".to_string(),
            ));
        }
        let job = self.jobs.get(job_id).await?;
        let connection_id = require_connection(&job)?;

        let (total_reviews, counted_from_store) = match total_reviews {
            Some(total) => (total, false),
            None => (self.store.count_for_connection(connection_id).await?, true),
        };
        let latest = match self.store.latest_for_connection(connection_id).await? {
            Some(feedback) => Some(feedback),
            None => self.store.latest().await?,
        };

        Ok(ResumeEstimate {
            job_id,
            connection_id,
            total_reviews,
            counted_from_store,
            page_size,
            estimated_page: (total_reviews.div_ceil(u64::from(page_size)) + 1) as u32,
            estimated_cursor: latest.map(|feedback| feedback.feedback_id),
        })
    }

    pub async fn status_view(&self, job_id: i64) -> Result<JobStatusView, PipelineError> {
        let job = self.jobs.get(job_id).await?;
        Ok(JobStatusView::from(&job))
    }
}

fn require_connection(job: &SyncJob) -> Result<i64, PipelineError> {
    job.current_connection_id.ok_or_else(|| {
        PipelineError::InvalidArgument(format!("job {} has no current connection id", job.id))
    })
}

/// Continuation after the newest `Page N | Cursor C` line in the job's
/// logs, preferring lines of the job's current shop.
fn position_from_logs(job: &SyncJob) -> Result<PageCursor, PipelineError> {
    let lines = job.log_lines();
    let shop_prefix = format!("{}: Page ", job.current_shop_name);
    let of_current_shop = |line: &&String| {
        job.current_shop_name.is_empty() || line.contains(shop_prefix.as_str())
    };

    lines
        .iter()
        .rev()
        .filter(of_current_shop)
        .find_map(|line| parse_progress_line(line))
        .or_else(|| lines.iter().rev().find_map(|line| parse_progress_line(line)))
        .map(|logged| logged.continuation())
        .ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "job {} logs hold no page/cursor line",
                job.id
            ))
        })
}
