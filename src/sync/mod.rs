//! # Sync Orchestrator
//!
//! Drives a persisted [`SyncJob`](crate::models::sync_job::Model) through the
//! seller ratings endpoint in one of two modes:
//!
//! - **full**: historical backfill over a day window, round-robin between
//!   shops in fixed-size batches ([`full`]).
//! - **incremental**: newest-first scan per shop that stops at the first
//!   review already stored ([`incremental`]).
//!
//! Everything runs sequentially: one page, one review, one job write at a
//! time. Progress is written to the job row after every batch. An
//! interrupt inside a batch commits the reviews already handled and the
//! position after the last page handled in full.

use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::clients::{ClientError, SellerApi, id_i64};
use crate::config::{AppConfig, ConfigError, SyncConfig};
use crate::error::PipelineError;
use crate::linker::Linker;
use crate::models::sync_job::{JobStatus, Model as SyncJob, SyncMode};
use crate::repositories::feedback::{FeedbackStore, UpsertOutcome};
use crate::repositories::sync_job::{ProgressUpdate, SyncJobRepository};
use crate::shops::ShopRegistry;
use crate::telemetry::job_run_span;

pub mod checkpoint;
pub mod full;
pub mod incremental;
pub mod retry;

pub use checkpoint::CheckpointFile;
pub use full::FullSyncOptions;
pub use retry::{RetryPolicy, fetch_with_retry, sleep_cancellable, with_retry};

/// Runtime settings of a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub sync: SyncConfig,
    pub language: String,
    pub tz: FixedOffset,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            sync: config.sync.clone(),
            language: config.seller_language.clone(),
            tz: config.shop_timezone()?,
        })
    }
}

/// Outcome of one run for a single shop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShopSummary {
    pub name: String,
    pub connection_id: i64,
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
    pub done: bool,
    /// Incremental mode stopped on a review that was already stored
    pub stopped_at_existing: bool,
}

/// Totals of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub job_id: i64,
    pub mode: SyncMode,
    pub status: JobStatus,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
    pub shops: Vec<ShopSummary>,
}

impl SyncSummary {
    fn new(job_id: i64, mode: SyncMode) -> Self {
        Self {
            job_id,
            mode,
            status: JobStatus::Running,
            processed: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            errors: 0,
            shops: Vec::new(),
        }
    }

    /// The one-line `synced/updated/errors` report printed by the CLI.
    pub fn one_line(&self) -> String {
        format!(
            "job {} {}: {} synced, {} updated, {} unchanged, {} errors",
            self.job_id, self.status, self.created, self.updated, self.unchanged, self.errors
        )
    }

    /// Adds the counts of one batch to the run and shop totals.
    fn absorb(&mut self, name: &str, connection_id: i64, counts: &BatchCounts, fetched: u64) {
        self.processed += counts.processed;
        self.created += counts.created;
        self.updated += counts.updated;
        self.unchanged += counts.unchanged;
        self.errors += counts.errors;
        let shop = self.shop_mut(name, connection_id);
        shop.fetched += fetched;
        shop.created += counts.created;
        shop.updated += counts.updated;
        shop.unchanged += counts.unchanged;
        shop.errors += counts.errors;
    }

    fn shop_mut(&mut self, name: &str, connection_id: i64) -> &mut ShopSummary {
        let pos = match self.shops.iter().position(|s| s.connection_id == connection_id) {
            Some(pos) => pos,
            None => {
                self.shops.push(ShopSummary {
                    name: name.to_string(),
                    connection_id,
                    ..ShopSummary::default()
                });
                self.shops.len() - 1
            }
        };
        &mut self.shops[pos]
    }
}

/// Counts from processing one batch of raw reviews.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BatchCounts {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
    pub last_feedback_id: Option<i64>,
    pub error_messages: Vec<String>,
}

impl BatchCounts {
    pub(crate) fn record(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub(crate) fn record_error(&mut self, message: String) {
        self.processed += 1;
        self.errors += 1;
        self.error_messages.push(message);
    }

    /// Counter part of a job progress write.
    pub(crate) fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            processed: self.processed as i64,
            synced: self.created as i64,
            updated: self.updated as i64,
            unchanged: self.unchanged as i64,
            errors: self.errors as i64,
            last_processed_feedback_id: self.last_feedback_id,
            error_messages: self.error_messages.clone(),
            ..ProgressUpdate::default()
        }
    }
}

/// A batch cut short by an interrupt or a fatal error.
#[derive(Debug)]
pub(crate) struct BatchAbort {
    /// Reviews handled before the abort
    pub counts: BatchCounts,
    pub error: PipelineError,
}

/// Keeps consecutive page fetches at least `delay` apart.
pub(crate) struct Pacer {
    delay: Duration,
    first: bool,
}

impl Pacer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self { delay, first: true }
    }

    pub(crate) async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if self.first {
            self.first = false;
            return if cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                Ok(())
            };
        }
        sleep_cancellable(self.delay, cancel).await
    }
}

/// One pipeline instance: shop registry, remote clients, stores and the
/// variant index shared through the linker.
pub struct SyncPipeline {
    registry: Arc<ShopRegistry>,
    seller: Arc<dyn SellerApi>,
    store: FeedbackStore,
    jobs: SyncJobRepository,
    settings: PipelineSettings,
    checkpoint: Option<CheckpointFile>,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<ShopRegistry>,
        seller: Arc<dyn SellerApi>,
        linker: Option<Arc<Linker>>,
        settings: PipelineSettings,
    ) -> Self {
        let store = match linker {
            Some(linker) => FeedbackStore::new(db.clone()).with_linker(linker),
            None => FeedbackStore::new(db.clone()),
        };
        Self {
            registry,
            seller,
            store,
            jobs: SyncJobRepository::new(db, settings.tz),
            settings,
            checkpoint: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` for operator interrupts.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_checkpoint(mut self, file: CheckpointFile) -> Self {
        self.checkpoint = Some(file);
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &FeedbackStore {
        &self.store
    }

    pub fn jobs(&self) -> &SyncJobRepository {
        &self.jobs
    }

    pub fn registry(&self) -> &ShopRegistry {
        &self.registry
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.settings.sync)
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs a full-mode job to completion, pause or failure.
    pub async fn run_full_sync(
        &self,
        job_id: i64,
        options: FullSyncOptions,
    ) -> Result<SyncSummary, PipelineError> {
        let span = job_run_span(job_id, SyncMode::Full.as_str());
        async {
            let job = self.begin_run(job_id, SyncMode::Full).await?;
            let mut summary = SyncSummary::new(job_id, SyncMode::Full);
            let result = self.full_sync(&job, options, &mut summary).await;
            self.finish_run(job_id, result, summary).await
        }
        .instrument(span)
        .await
    }

    /// Runs an incremental-mode job to completion, pause or failure.
    pub async fn run_incremental_sync(&self, job_id: i64) -> Result<SyncSummary, PipelineError> {
        let span = job_run_span(job_id, SyncMode::Incremental.as_str());
        async {
            let job = self.begin_run(job_id, SyncMode::Incremental).await?;
            let mut summary = SyncSummary::new(job_id, SyncMode::Incremental);
            let result = self.incremental_sync(&job, &mut summary).await;
            self.finish_run(job_id, result, summary).await
        }
        .instrument(span)
        .await
    }

    async fn begin_run(&self, job_id: i64, mode: SyncMode) -> Result<SyncJob, PipelineError> {
        let job = self.jobs.get(job_id).await?;
        if job.mode() != Some(mode) {
            return Err(PipelineError::InvalidArgument(format!(
                "job {job_id} is a {} sync, not {mode}",
                job.sync_type
            )));
        }
        match job.job_status() {
            Some(JobStatus::Pending | JobStatus::Paused | JobStatus::Failed) => {}
            _ => {
                return Err(PipelineError::InvalidJobState {
                    job_id,
                    status: job.status.clone(),
                    action: "run",
                });
            }
        }
        let job = self.jobs.set_status(job_id, JobStatus::Running).await?;
        info!(job_id, mode = %mode, "Sync job started");
        Ok(job)
    }

    async fn finish_run(
        &self,
        job_id: i64,
        result: Result<(), PipelineError>,
        mut summary: SyncSummary,
    ) -> Result<SyncSummary, PipelineError> {
        match result {
            Ok(()) => {
                summary.status = JobStatus::Completed;
                self.jobs
                    .update_job_progress(
                        job_id,
                        ProgressUpdate::log(format!("Finished: {}", summary.one_line())),
                    )
                    .await?;
                self.jobs.set_status(job_id, JobStatus::Completed).await?;
                info!(
                    job_id,
                    created = summary.created,
                    updated = summary.updated,
                    errors = summary.errors,
                    "Sync job completed"
                );
                Ok(summary)
            }
            Err(PipelineError::Cancelled) => {
                summary.status = JobStatus::Paused;
                self.jobs
                    .update_job_progress(
                        job_id,
                        ProgressUpdate::log("Interrupted; paused after the last handled page"),
                    )
                    .await?;
                self.jobs.set_status(job_id, JobStatus::Paused).await?;
                warn!(job_id, "Sync job paused by interrupt");
                Ok(summary)
            }
            Err(e) => {
                error!(job_id, error = %e, "Sync job failed");
                let recorded = self
                    .jobs
                    .update_job_progress(job_id, ProgressUpdate::error(format!("Sync failed: {e}")))
                    .await;
                if let Err(write_err) = recorded {
                    error!(job_id, error = %write_err, "Could not record job failure");
                }
                if let Err(write_err) = self.jobs.set_status(job_id, JobStatus::Failed).await {
                    error!(job_id, error = %write_err, "Could not mark job failed");
                }
                Err(e)
            }
        }
    }

    /// Upserts each raw review in order. Malformed reviews are counted as
    /// errors; fatal errors and interrupts abort the batch, keeping the
    /// counts of the reviews handled before.
    pub(crate) async fn process_items(
        &self,
        shop: &str,
        connection_id: i64,
        items: &[JsonValue],
    ) -> Result<BatchCounts, BatchAbort> {
        let mut counts = BatchCounts::default();
        for item in items {
            if let Err(error) = self.check_cancelled() {
                return Err(BatchAbort { counts, error });
            }
            match self.store.upsert(connection_id, item).await {
                Ok(outcome) => {
                    counts.record(outcome);
                    if let Some(id) = item.get("comment_id").and_then(id_i64) {
                        counts.last_feedback_id = Some(id);
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!(shop, connection_id, error = %e, "Review skipped");
                    counts.record_error(format!("{shop}: review skipped: {e}"));
                }
                Err(error) => return Err(BatchAbort { counts, error }),
            }
        }
        Ok(counts)
    }

    pub(crate) async fn write_checkpoint(
        &self,
        job_id: i64,
        shop: &str,
        connection_id: i64,
        page_number: u32,
        cursor: i64,
    ) {
        if let Some(file) = &self.checkpoint {
            file.write(job_id, shop, connection_id, page_number, cursor)
                .await;
        }
    }
}

/// Whether a failed page fetch ends the whole job.
pub(crate) fn is_job_fatal(error: &PipelineError) -> bool {
    match error {
        PipelineError::Remote(ClientError::AuthExpired { .. }) => true,
        PipelineError::Remote(_) => false,
        _ => true,
    }
}
