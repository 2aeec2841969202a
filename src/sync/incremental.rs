//! Incremental mode: newest-first scan per shop that stops at the first
//! review already in the store.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::{Pacer, SyncPipeline, SyncSummary, fetch_with_retry, is_job_fatal};
use crate::clients::seller::MAX_PAGE_SIZE;
use crate::clients::{RatingsQuery, id_i64};
use crate::config::SyncConfig;
use crate::cursor::{PageCursor, progress_line};
use crate::error::PipelineError;
use crate::models::sync_job::Model as SyncJob;
use crate::repositories::sync_job::{JobPosition, ProgressUpdate};
use crate::shops::Shop;

/// `time_start` of an incremental run: the newest stored review minus the
/// overlap, or the default look-back when the store is empty.
pub fn incremental_window_start(newest_stored: Option<i64>, now: i64, config: &SyncConfig) -> i64 {
    match newest_stored {
        Some(newest) => newest - config.incremental_overlap_secs,
        None => now - config.incremental_default_lookback_days * 86_400,
    }
}

impl SyncPipeline {
    pub(crate) async fn incremental_sync(
        &self,
        job: &SyncJob,
        summary: &mut SyncSummary,
    ) -> Result<(), PipelineError> {
        let shops = self.registry.list_shops();
        let now = Utc::now().timestamp();
        let newest = self.store.max_create_time().await?;
        let window = (
            Some(incremental_window_start(newest, now, &self.settings.sync)),
            Some(now),
        );
        let start = job.current_shop_index.max(0) as usize;

        info!(
            job_id = job.id,
            shops = shops.len(),
            start_index = start,
            time_start = ?window.0,
            "Incremental sync starting"
        );
        self.jobs
            .update_job_progress(
                job.id,
                ProgressUpdate::log(format!(
                    "Scanning {} shops for reviews since {}",
                    shops.len().saturating_sub(start),
                    window.0.unwrap_or_default()
                )),
            )
            .await?;

        let mut pacer = Pacer::new(Duration::from_millis(self.settings.sync.inter_page_delay_ms));
        for (index, shop) in shops.iter().enumerate().skip(start) {
            self.check_cancelled()?;
            self.scan_shop(job, index, shop, window, &mut pacer, summary)
                .await?;
        }
        Ok(())
    }

    async fn scan_shop(
        &self,
        job: &SyncJob,
        index: usize,
        shop: &Shop,
        window: (Option<i64>, Option<i64>),
        pacer: &mut Pacer,
        summary: &mut SyncSummary,
    ) -> Result<(), PipelineError> {
        let page_size = job.batch_size.clamp(1, MAX_PAGE_SIZE as i32) as u32;
        let mut position = PageCursor::first();
        summary.shop_mut(&shop.name, shop.connection_id);

        for _ in 0..self.settings.sync.incremental_max_batches {
            pacer.wait(&self.cancel).await?;
            let query = RatingsQuery::at(
                shop.connection_id,
                window,
                &position,
                page_size,
                &self.settings.language,
            );
            let page = match fetch_with_retry(
                self.seller.as_ref(),
                &query,
                self.retry_policy(),
                &self.cancel,
            )
            .await
            {
                Ok(page) => page,
                Err(e) if is_job_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(shop = %shop.name, page = position.page_number, error = %e, "Shop scan failed");
                    self.jobs
                        .update_job_progress(
                            job.id,
                            ProgressUpdate::error(format!(
                                "{}: page {} failed, shop skipped: {e}",
                                shop.name, position.page_number
                            )),
                        )
                        .await?;
                    let totals = summary.shop_mut(&shop.name, shop.connection_id);
                    totals.errors += 1;
                    totals.done = true;
                    summary.errors += 1;
                    return Ok(());
                }
            };

            if page.items.is_empty() {
                self.commit_shop_done(job, index, shop, &position, "no more reviews")
                    .await?;
                summary.shop_mut(&shop.name, shop.connection_id).done = true;
                return Ok(());
            }

            let fetched_page = position.page_number;
            let last_comment_id = page.last_comment_id();
            let (fresh, stopped) = self.unseen_prefix(page.items).await?;
            let counts = match self
                .process_items(&shop.name, shop.connection_id, &fresh)
                .await
            {
                Ok(counts) => counts,
                Err(abort) => {
                    if matches!(abort.error, PipelineError::Cancelled) {
                        // the page is scanned again on the next run
                        let mut update = abort.counts.progress();
                        update.log_messages = vec![format!(
                            "{}: interrupted on page {fetched_page} after {} reviews",
                            shop.name, abort.counts.processed
                        )];
                        update.position = Some(JobPosition {
                            shop_index: index as i32,
                            shop_name: shop.name.clone(),
                            connection_id: Some(shop.connection_id),
                            page: position.page_number as i32,
                            cursor: position.stored_cursor(),
                        });
                        self.jobs.update_job_progress(job.id, update).await?;
                        summary.absorb(&shop.name, shop.connection_id, &abort.counts, 0);
                    }
                    return Err(abort.error);
                }
            };
            position.advance(last_comment_id);

            let mut logs = vec![progress_line(
                &shop.name,
                fetched_page,
                position.cursor,
                fresh.len(),
            )];
            if stopped {
                logs.push(format!("{}: reached stored reviews; shop done", shop.name));
            }
            let mut update = counts.progress();
            update.log_messages = logs;
            update.position = Some(JobPosition {
                shop_index: index as i32,
                shop_name: shop.name.clone(),
                connection_id: Some(shop.connection_id),
                page: position.page_number as i32,
                cursor: position.stored_cursor(),
            });
            self.jobs.update_job_progress(job.id, update).await?;
            self.write_checkpoint(
                job.id,
                &shop.name,
                shop.connection_id,
                position.page_number,
                position.cursor,
            )
            .await;

            summary.absorb(&shop.name, shop.connection_id, &counts, fresh.len() as u64);

            if stopped {
                let totals = summary.shop_mut(&shop.name, shop.connection_id);
                totals.stopped_at_existing = true;
                totals.done = true;
                info!(shop = %shop.name, page = fetched_page, "Reached a stored review; shop done");
                return Ok(());
            }
        }

        warn!(
            shop = %shop.name,
            batches = self.settings.sync.incremental_max_batches,
            "Batch limit reached before a stored review"
        );
        self.commit_shop_done(job, index, shop, &position, "batch limit reached")
            .await?;
        summary.shop_mut(&shop.name, shop.connection_id).done = true;
        Ok(())
    }

    /// Items up to, not including, the first one already stored. The flag
    /// tells whether such an item was found.
    async fn unseen_prefix(
        &self,
        items: Vec<JsonValue>,
    ) -> Result<(Vec<JsonValue>, bool), PipelineError> {
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if let Some(feedback_id) = item.get("comment_id").and_then(id_i64)
                && self.store.exists(feedback_id).await?
            {
                return Ok((fresh, true));
            }
            fresh.push(item);
        }
        Ok((fresh, false))
    }

    async fn commit_shop_done(
        &self,
        job: &SyncJob,
        index: usize,
        shop: &Shop,
        position: &PageCursor,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let update = ProgressUpdate {
            position: Some(JobPosition {
                shop_index: index as i32,
                shop_name: shop.name.clone(),
                connection_id: Some(shop.connection_id),
                page: position.page_number as i32,
                cursor: position.stored_cursor(),
            }),
            ..ProgressUpdate::log(format!("{}: {reason}; shop done", shop.name))
        };
        self.jobs.update_job_progress(job.id, update).await?;
        Ok(())
    }
}
