//! Full mode: historical backfill over a day window.
//!
//! Shops are visited round-robin, starting at the job's
//! `current_shop_index`. Each visit fetches pages until
//! `full_batch_items` reviews are in hand, then processes them and commits
//! the batch. Per-shop state lives in `shop_progress[shop name]` and is the
//! authoritative resume point; the `current_*` columns mirror the shop that
//! committed last.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{
    BatchCounts, Pacer, SyncPipeline, SyncSummary, fetch_with_retry, is_job_fatal, with_retry,
};
use crate::clients::seller::MAX_PAGE_SIZE;
use crate::clients::{ClientError, RatingsQuery};
use crate::cursor::{PageCursor, progress_line};
use crate::error::PipelineError;
use crate::models::sync_job::Model as SyncJob;
use crate::repositories::sync_job::{JobPosition, ProgressUpdate};
use crate::shops::Shop;

/// Options of one full-mode run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullSyncOptions {
    /// Skip ahead past reviews already stored for a shop that would
    /// otherwise start on page 1.
    pub auto_resume_from_db: bool,
}

/// Crawl state of one shop, persisted in `shop_progress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopProgress {
    pub connection_id: i64,
    pub page_number: u32,
    pub cursor: i64,
    pub from_page_number: u32,
    /// Reviews fetched so far, after truncation at the cap
    pub fetched: u64,
    /// `None` means unlimited
    pub max_items: Option<u64>,
    /// Probed total, informational
    pub total: Option<u64>,
    pub done: bool,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ShopProgress {
    pub fn new(connection_id: i64) -> Self {
        let mut progress = Self {
            connection_id,
            ..Self::default()
        };
        progress.set_position(&PageCursor::first());
        progress
    }

    /// The stored entry for `connection_id`, if `entry` holds one.
    pub fn restore(entry: &JsonValue, connection_id: i64) -> Option<Self> {
        let progress: Self = serde_json::from_value(entry.clone()).ok()?;
        (progress.connection_id == connection_id).then_some(progress)
    }

    pub fn position(&self) -> PageCursor {
        PageCursor {
            page_number: self.page_number.max(1),
            cursor: self.cursor,
            from_page_number: self.from_page_number.max(1),
        }
    }

    pub fn set_position(&mut self, position: &PageCursor) {
        self.page_number = position.page_number;
        self.cursor = position.cursor;
        self.from_page_number = position.from_page_number;
    }

    fn cap_reached(&self) -> bool {
        self.max_items.is_some_and(|max| self.fetched >= max)
    }

    /// Estimated reviews for this shop, used for `total_feedbacks`.
    fn expected(&self) -> u64 {
        self.max_items.or(self.total).unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<JsonValue, PipelineError> {
        serde_json::to_value(self)
            .map_err(|e| PipelineError::data_shape(format!("shop progress: {e}")))
    }
}

/// `[now - days, now]` as epoch seconds; no window when `days` is unset or
/// not positive.
pub fn full_window(days: Option<i32>, now: DateTime<FixedOffset>) -> (Option<i64>, Option<i64>) {
    match days {
        Some(days) if days > 0 => {
            let start = now - chrono::Duration::days(i64::from(days));
            (Some(start.timestamp()), Some(now.timestamp()))
        }
        _ => (None, None),
    }
}

/// Shop state after one page of a batch was fetched or skipped, with the
/// number of items, logs and page errors gathered up to that page.
struct PageMark {
    progress: ShopProgress,
    items_end: usize,
    logs_end: usize,
    errors_end: usize,
}

/// One shop of the run with its in-memory state.
struct ShopRun<'a> {
    index: usize,
    shop: &'a Shop,
    progress: ShopProgress,
    prepared: bool,
}

impl SyncPipeline {
    pub(crate) async fn full_sync(
        &self,
        job: &SyncJob,
        options: FullSyncOptions,
        summary: &mut SyncSummary,
    ) -> Result<(), PipelineError> {
        let shops = self.registry.list_shops();
        if shops.is_empty() {
            self.jobs
                .update_job_progress(job.id, ProgressUpdate::log("No shops configured"))
                .await?;
            return Ok(());
        }

        let now = Utc::now().with_timezone(&self.settings.tz);
        let window = full_window(job.days, now);
        let cap = job.max_feedbacks_per_shop.map(|cap| cap.max(0) as u64);
        let start = (job.current_shop_index.max(0) as usize) % shops.len();

        let mut runs: Vec<ShopRun<'_>> = (0..shops.len())
            .map(|offset| {
                let index = (start + offset) % shops.len();
                restore_shop(job, index, &shops[index])
            })
            .collect();

        info!(
            job_id = job.id,
            shops = shops.len(),
            start_index = start,
            days = ?job.days,
            "Full sync starting"
        );

        for run in runs.iter_mut().filter(|run| !run.prepared) {
            self.prepare_shop(job, run, window, cap, options).await?;
        }
        let total: u64 = runs.iter().map(|run| run.progress.expected()).sum();
        self.jobs
            .update_job_progress(
                job.id,
                ProgressUpdate {
                    total_feedbacks: Some(total as i64),
                    log_messages: vec![format!(
                        "Crawling {} shops, about {total} reviews",
                        shops.len()
                    )],
                    ..ProgressUpdate::default()
                },
            )
            .await?;

        let mut pacer = Pacer::new(Duration::from_millis(self.settings.sync.inter_page_delay_ms));
        while runs.iter().any(|run| !run.progress.done) {
            for run in runs.iter_mut().filter(|run| !run.progress.done) {
                self.check_cancelled()?;
                self.run_shop_batch(job, run, window, &mut pacer, summary)
                    .await?;
            }
        }

        for run in &runs {
            let shop = summary.shop_mut(&run.shop.name, run.shop.connection_id);
            shop.done = run.progress.done;
        }
        Ok(())
    }

    /// Probes the shop total and fixes `max_items`. A failed probe leaves
    /// the total unknown; only expired credentials end the job.
    async fn prepare_shop(
        &self,
        job: &SyncJob,
        run: &mut ShopRun<'_>,
        window: (Option<i64>, Option<i64>),
        cap: Option<u64>,
        options: FullSyncOptions,
    ) -> Result<(), PipelineError> {
        let shop = run.shop;
        let mut update = ProgressUpdate::default();

        if cap == Some(0) {
            run.progress.max_items = Some(0);
            run.progress.done = true;
            update
                .log_messages
                .push(format!("{}: per-shop cap is 0; skipped", shop.name));
        } else {
            if options.auto_resume_from_db && run.progress.page_number <= 1 {
                self.resume_from_store(job, run, &mut update).await?;
            }

            let what = format!("connection {} probe", shop.connection_id);
            let probed = with_retry(self.retry_policy(), &self.cancel, &what, || {
                self.seller
                    .probe_total(shop.connection_id, window, &self.settings.language)
            })
            .await;
            match probed {
                Ok(total) => {
                    run.progress.total = Some(total);
                    run.progress.max_items = cap.map(|cap| cap.min(total));
                    update.log_messages.push(format!(
                        "{}: {total} reviews in window, fetching {}",
                        shop.name,
                        run.progress
                            .max_items
                            .map_or_else(|| "all".to_string(), |max| max.to_string())
                    ));
                }
                Err(PipelineError::Remote(e)) if !matches!(e, ClientError::AuthExpired { .. }) => {
                    warn!(shop = %shop.name, error = %e, "Could not probe shop total");
                    run.progress.max_items = cap;
                    run.progress.errors += 1;
                    run.progress.last_error = Some(e.to_string());
                    update.errors += 1;
                    update
                        .error_messages
                        .push(format!("{}: total probe failed: {e}", shop.name));
                }
                Err(e) => return Err(e),
            }
            if run.progress.cap_reached() {
                run.progress.done = true;
            }
        }

        update.shop_progress = Some((shop.name.clone(), run.progress.to_json()?));
        self.jobs.update_job_progress(job.id, update).await?;
        run.prepared = true;
        Ok(())
    }

    /// Moves a shop that would start on page 1 past the reviews already
    /// stored for it.
    async fn resume_from_store(
        &self,
        job: &SyncJob,
        run: &mut ShopRun<'_>,
        update: &mut ProgressUpdate,
    ) -> Result<(), PipelineError> {
        let connection_id = run.shop.connection_id;
        let stored = self.store.count_for_connection(connection_id).await?;
        if stored == 0 {
            return Ok(());
        }
        let Some(latest) = self.store.latest_for_connection(connection_id).await? else {
            return Ok(());
        };
        let page_size = job.page_size.clamp(1, MAX_PAGE_SIZE as i32) as u64;
        let page = (stored.div_ceil(page_size) + 1) as u32;
        run.progress
            .set_position(&PageCursor::resume_at(page, Some(latest.feedback_id)));
        info!(
            shop = %run.shop.name,
            stored,
            page,
            cursor = latest.feedback_id,
            "Resuming shop from stored reviews"
        );
        update.log_messages.push(format!(
            "{}: {stored} reviews already stored; resuming at page {page}",
            run.shop.name
        ));
        Ok(())
    }

    /// Fetches up to one batch for the shop, processes it and commits the
    /// batch. An interrupt while fetching writes nothing; one while
    /// processing commits what was handled.
    async fn run_shop_batch(
        &self,
        job: &SyncJob,
        run: &mut ShopRun<'_>,
        window: (Option<i64>, Option<i64>),
        pacer: &mut Pacer,
        summary: &mut SyncSummary,
    ) -> Result<(), PipelineError> {
        let shop = run.shop;
        let batch_limit = self.settings.sync.full_batch_items as usize;
        let max_failures = self.settings.sync.max_consecutive_page_failures;
        let page_size = job.page_size.clamp(1, MAX_PAGE_SIZE as i32) as u32;

        let mut next = run.progress.clone();
        let mut position = next.position();
        let mut items: Vec<JsonValue> = Vec::new();
        let mut logs: Vec<String> = Vec::new();
        let mut page_errors: Vec<String> = Vec::new();
        let mut marks: Vec<PageMark> = Vec::new();

        while items.len() < batch_limit && !next.done {
            if next.cap_reached() {
                next.done = true;
                break;
            }
            pacer.wait(&self.cancel).await?;
            let query = RatingsQuery::at(
                shop.connection_id,
                window,
                &position,
                page_size,
                &self.settings.language,
            );
            match fetch_with_retry(self.seller.as_ref(), &query, self.retry_policy(), &self.cancel)
                .await
            {
                Ok(page) => {
                    next.consecutive_failures = 0;
                    if page.items.is_empty() {
                        debug!(shop = %shop.name, page = position.page_number, "Empty page");
                        logs.push(format!(
                            "{}: Page {} is empty; shop done",
                            shop.name, position.page_number
                        ));
                        next.done = true;
                        marks.push(page_mark(&next, &position, &items, &logs, &page_errors));
                        break;
                    }
                    let fetched_page = position.page_number;
                    let last_comment_id = page.last_comment_id();
                    let mut page_items = page.items;
                    if let Some(max) = next.max_items {
                        page_items.truncate(max.saturating_sub(next.fetched) as usize);
                    }
                    next.fetched += page_items.len() as u64;
                    position.advance(last_comment_id);
                    logs.push(progress_line(
                        &shop.name,
                        fetched_page,
                        position.cursor,
                        page_items.len(),
                    ));
                    self.write_checkpoint(
                        job.id,
                        &shop.name,
                        shop.connection_id,
                        position.page_number,
                        position.cursor,
                    )
                    .await;
                    items.extend(page_items);
                }
                Err(e) if is_job_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(shop = %shop.name, page = position.page_number, error = %e, "Page skipped");
                    page_errors.push(format!(
                        "{}: page {} skipped: {e}",
                        shop.name, position.page_number
                    ));
                    next.last_error = Some(e.to_string());
                    next.consecutive_failures += 1;
                    position.skip();
                    if next.consecutive_failures >= max_failures {
                        page_errors.push(format!(
                            "{}: {} pages failed in a row; shop abandoned",
                            shop.name, next.consecutive_failures
                        ));
                        next.done = true;
                    }
                }
            }
            marks.push(page_mark(&next, &position, &items, &logs, &page_errors));
        }
        next.set_position(&position);

        let counts = match self
            .process_items(&shop.name, shop.connection_id, &items)
            .await
        {
            Ok(counts) => counts,
            Err(abort) => {
                if matches!(abort.error, PipelineError::Cancelled) {
                    // keep the state after the last page whose items were
                    // all handled; later pages are fetched again on resume
                    let handled = abort.counts.processed as usize;
                    let (resume, logs_end, errors_end) =
                        match marks.iter().rev().find(|mark| mark.items_end <= handled) {
                            Some(mark) => (mark.progress.clone(), mark.logs_end, mark.errors_end),
                            None => (run.progress.clone(), 0, 0),
                        };
                    logs.truncate(logs_end);
                    page_errors.truncate(errors_end);
                    let shop_errors = page_errors.len() as u64;
                    self.commit_interrupted(job, run, resume, logs, page_errors, &abort.counts)
                        .await?;

                    summary.absorb(&shop.name, shop.connection_id, &abort.counts, 0);
                    summary.errors += shop_errors;
                    summary.shop_mut(&shop.name, shop.connection_id).errors += shop_errors;
                }
                return Err(abort.error);
            }
        };
        let shop_errors = page_errors.len() as u64;
        next.created += counts.created;
        next.updated += counts.updated;
        next.unchanged += counts.unchanged;
        next.errors += counts.errors + shop_errors;
        if next.cap_reached() {
            next.done = true;
        }

        logs.push(format!(
            "{}: batch of {} reviews ({} created, {} updated, {} unchanged, {} errors){}",
            shop.name,
            items.len(),
            counts.created,
            counts.updated,
            counts.unchanged,
            counts.errors + shop_errors,
            if next.done { "; shop done" } else { "" }
        ));

        let mut update = counts.progress();
        update.errors += shop_errors as i64;
        update.error_messages.extend(page_errors);
        update.log_messages = logs;
        update.position = Some(JobPosition {
            shop_index: run.index as i32,
            shop_name: shop.name.clone(),
            connection_id: Some(shop.connection_id),
            page: position.page_number as i32,
            cursor: position.stored_cursor(),
        });
        update.shop_progress = Some((shop.name.clone(), next.to_json()?));
        self.jobs.update_job_progress(job.id, update).await?;

        info!(
            shop = %shop.name,
            fetched = items.len(),
            created = counts.created,
            updated = counts.updated,
            errors = counts.errors + shop_errors,
            page = position.page_number,
            done = next.done,
            "Full sync batch committed"
        );

        summary.absorb(&shop.name, shop.connection_id, &counts, items.len() as u64);
        summary.errors += shop_errors;
        let totals = summary.shop_mut(&shop.name, shop.connection_id);
        totals.errors += shop_errors;
        totals.done = next.done;

        run.progress = next;
        Ok(())
    }

    /// Commits the reviews handled by an interrupted batch together with
    /// the `resume` state of the shop.
    async fn commit_interrupted(
        &self,
        job: &SyncJob,
        run: &ShopRun<'_>,
        mut resume: ShopProgress,
        mut logs: Vec<String>,
        page_errors: Vec<String>,
        counts: &BatchCounts,
    ) -> Result<(), PipelineError> {
        let shop = run.shop;
        let shop_errors = page_errors.len() as u64;
        resume.created += counts.created;
        resume.updated += counts.updated;
        resume.unchanged += counts.unchanged;
        resume.errors += counts.errors + shop_errors;
        let position = resume.position();

        logs.push(format!(
            "{}: interrupted after {} reviews; resuming at page {}",
            shop.name, counts.processed, position.page_number
        ));
        let mut update = counts.progress();
        update.errors += shop_errors as i64;
        update.error_messages.extend(page_errors);
        update.log_messages = logs;
        update.position = Some(JobPosition {
            shop_index: run.index as i32,
            shop_name: shop.name.clone(),
            connection_id: Some(shop.connection_id),
            page: position.page_number as i32,
            cursor: position.stored_cursor(),
        });
        update.shop_progress = Some((shop.name.clone(), resume.to_json()?));
        self.jobs.update_job_progress(job.id, update).await?;
        info!(
            shop = %shop.name,
            handled = counts.processed,
            created = counts.created,
            page = position.page_number,
            "Interrupted batch committed"
        );
        Ok(())
    }
}

fn page_mark(
    progress: &ShopProgress,
    position: &PageCursor,
    items: &[JsonValue],
    logs: &[String],
    page_errors: &[String],
) -> PageMark {
    let mut progress = progress.clone();
    progress.set_position(position);
    PageMark {
        progress,
        items_end: items.len(),
        logs_end: logs.len(),
        errors_end: page_errors.len(),
    }
}

/// In-memory state for `shop`: its `shop_progress` entry when one exists
/// for the same connection, else the job's `current_*` position when it
/// points at this shop, else a fresh start.
fn restore_shop<'a>(job: &SyncJob, index: usize, shop: &'a Shop) -> ShopRun<'a> {
    if let Some(progress) = job
        .shop_progress
        .get(&shop.name)
        .and_then(|entry| ShopProgress::restore(entry, shop.connection_id))
    {
        return ShopRun {
            index,
            shop,
            progress,
            prepared: true,
        };
    }

    let mut progress = ShopProgress::new(shop.connection_id);
    if job.current_connection_id == Some(shop.connection_id) && job.current_page > 1 {
        progress.set_position(&PageCursor::resume_at(
            job.current_page as u32,
            job.current_cursor,
        ));
    }
    ShopRun {
        index,
        shop,
        progress,
        prepared: false,
    }
}
