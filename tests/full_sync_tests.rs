//! Full-mode orchestrator runs against a scripted seller portal.

use std::sync::Arc;

use anyhow::Result;
use feedback_sync::clients::ClientError;
use feedback_sync::error::PipelineError;
use feedback_sync::jobs::{JobControl, ResumeStrategy};
use feedback_sync::linker::Linker;
use feedback_sync::models::sync_job::JobStatus;
use feedback_sync::sync::{FullSyncOptions, SyncPipeline};
use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait};
use tokio_util::sync::CancellationToken;

mod test_utils;
use test_utils::{FakeErp, FakeSeller, pages_of, pipeline, registry, review_json, setup_test_db, test_settings};

fn control(db: &DatabaseConnection, shops: &[(&str, i64)], seller: Arc<FakeSeller>) -> JobControl {
    JobControl::new(db.clone(), registry(shops), seller, test_settings())
}

async fn feedback_rows(db: &DatabaseConnection) -> Result<u64> {
    Ok(feedback_sync::models::Feedback::find().count(db).await?)
}

#[tokio::test]
async fn fresh_full_sync_single_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 100, 50))
            .with_total(100, 100),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.created, 100);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.errors, 0);
    assert!(summary.shops[0].done);

    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.status, "completed");
    assert_eq!(job.current_page, 3);
    assert_eq!(job.current_cursor, Some(100));
    assert_eq!(job.synced_feedbacks, 100);
    assert_eq!(job.processed_feedbacks, 100);
    assert_eq!(job.total_feedbacks, 100);
    assert_eq!(job.shop_progress["alpha"]["done"], true);
    assert_eq!(job.shop_progress["alpha"]["fetched"], 100);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    assert_eq!(seller.fetches_for(100), vec![1, 2, 3]);
    let second = &seller.queries()[1];
    assert_eq!(second.cursor, 50);
    assert_eq!(second.from_page_number, 1);
    assert_eq!(feedback_rows(&db).await?, 100);
    Ok(())
}

#[tokio::test]
async fn rerun_over_same_window_is_unchanged() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 100, 50)));
    let control = control(&db, &shops, seller.clone());

    let first = control.create_full_sync(Some(365), 50, None).await?;
    pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(first.id, FullSyncOptions::default())
        .await?;

    let second = control.create_full_sync(Some(365), 50, None).await?;
    let summary = pipeline(&db, registry(&shops), seller, None)
        .run_full_sync(second.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.unchanged, 100);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.updated, 0);
    let job = control.jobs().get(second.id).await?;
    assert_eq!(job.unchanged_feedbacks, 100);
    assert_eq!(feedback_rows(&db).await?, 100);
    Ok(())
}

#[tokio::test]
async fn per_shop_cap_truncates_the_last_page() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 100, 50)));
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, Some(30)).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.created, 30);
    assert_eq!(seller.fetches_for(100), vec![1]);
    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.total_feedbacks, 30);
    assert_eq!(job.current_page, 2);
    assert_eq!(job.shop_progress["alpha"]["max_items"], 30);
    assert_eq!(feedback_rows(&db).await?, 30);
    Ok(())
}

#[tokio::test]
async fn zero_cap_fetches_nothing() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 100, 50)));
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, Some(0)).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.processed, 0);
    assert!(seller.queries().is_empty());
    assert_eq!(seller.probe_count(), 0);
    Ok(())
}

#[tokio::test]
async fn shops_are_visited_round_robin_in_batches() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100), ("beta", 200)];
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 100, 50))
            .with_pages(200, pages_of(1_000, 100, 50)),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let mut settings = test_settings();
    settings.sync.full_batch_items = 50;
    let summary = SyncPipeline::new(db.clone(), registry(&shops), seller.clone(), None, settings)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    let order: Vec<(i64, u32)> = seller
        .queries()
        .iter()
        .map(|q| (q.connection_id, q.page_number))
        .collect();
    assert_eq!(
        order,
        vec![(100, 1), (200, 1), (100, 2), (200, 2), (100, 3), (200, 3)]
    );
    assert_eq!(summary.created, 200);

    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.total_shops, 2);
    assert_eq!(job.current_shop_name, "beta");
    assert_eq!(job.current_shop_index, 1);
    assert_eq!(job.shop_progress["alpha"]["fetched"], 100);
    assert_eq!(job.shop_progress["beta"]["fetched"], 100);
    Ok(())
}

#[tokio::test]
async fn exhausted_page_is_skipped_and_recorded() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 150, 50))
            .failing(100, 2, ClientError::transient("timeout"), 2),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.created, 100);
    assert_eq!(summary.errors, 1);
    assert_eq!(seller.fetches_for(100), vec![1, 2, 2, 3, 4]);

    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.error_count, 1);
    assert!(
        job.error_lines()
            .iter()
            .any(|line| line.contains("alpha: page 2 skipped"))
    );
    assert!(job.log_lines().iter().any(|line| line.contains("Page 3 | Cursor 150")));
    Ok(())
}

#[tokio::test]
async fn consecutive_failures_abandon_the_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100), ("beta", 200)];
    let mut seller = FakeSeller::new()
        .with_pages(100, pages_of(1, 250, 50))
        .with_pages(200, pages_of(1_000, 10, 50));
    for page in 1..=3 {
        seller = seller.failing(100, page, ClientError::permanent("bad request"), 1);
    }
    let seller = Arc::new(seller);
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.created, 10);
    assert_eq!(seller.fetches_for(100), vec![1, 2, 3]);
    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.shop_progress["alpha"]["done"], true);
    assert!(job.error_lines().iter().any(|l| l.contains("shop abandoned")));
    Ok(())
}

#[tokio::test]
async fn expired_credentials_fail_the_job() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 100, 50))
            .failing(100, 2, ClientError::auth_expired("401"), 1),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let result = pipeline(&db, registry(&shops), seller, None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::Remote(ClientError::AuthExpired { .. }))
    ));
    let job = control.jobs().get(job.id).await?;
    assert_eq!(job.status, "failed");
    assert!(job.completed_at.is_some());
    assert!(job.error_lines().iter().any(|l| l.contains("Sync failed")));
    Ok(())
}

#[tokio::test]
async fn malformed_review_is_counted_and_skipped() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let mut bad = review_json(2);
    bad.as_object_mut().unwrap().remove("comment_id");
    let seller = Arc::new(
        FakeSeller::new().with_pages(100, vec![vec![review_json(1), bad, review_json(3)]]),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller, None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.errors, 1);
    let job = control.jobs().get(job.id).await?;
    assert_eq!(
        job.processed_feedbacks,
        job.synced_feedbacks + job.updated_feedbacks + job.unchanged_feedbacks + job.error_count
    );
    Ok(())
}

#[tokio::test]
async fn interrupt_pauses_at_last_committed_batch_and_resumes() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let token = CancellationToken::new();
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 150, 50))
            .cancel_on_fetch(2, token.clone()),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let mut settings = test_settings();
    settings.sync.full_batch_items = 50;
    let summary = SyncPipeline::new(
        db.clone(),
        registry(&shops),
        seller.clone(),
        None,
        settings.clone(),
    )
    .with_cancellation(token)
    .run_full_sync(job.id, FullSyncOptions::default())
    .await?;

    assert_eq!(summary.status, JobStatus::Paused);
    let paused = control.jobs().get(job.id).await?;
    assert_eq!(paused.status, "paused");
    assert_eq!(paused.current_page, 2);
    assert_eq!(paused.current_cursor, Some(50));
    assert_eq!(paused.processed_feedbacks, 50);

    let resumed = control.resume(job.id).await?;
    assert_eq!(resumed.status, "pending");
    let summary = SyncPipeline::new(db.clone(), registry(&shops), seller.clone(), None, settings)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.created, 100);
    let done = control.jobs().get(job.id).await?;
    assert_eq!(done.synced_feedbacks, 150);
    assert_eq!(done.current_page, 4);
    assert_eq!(feedback_rows(&db).await?, 150);
    Ok(())
}

#[tokio::test]
async fn interrupt_while_upserting_keeps_handled_reviews() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let token = CancellationToken::new();
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 100, 50)));
    let erp = Arc::new(FakeErp::new().cancel_on_lookup(60, token.clone()));
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = SyncPipeline::new(
        db.clone(),
        registry(&shops),
        seller.clone(),
        Some(Arc::new(Linker::new(erp))),
        test_settings(),
    )
    .with_cancellation(token)
    .run_full_sync(job.id, FullSyncOptions::default())
    .await?;

    assert_eq!(summary.status, JobStatus::Paused);
    assert_eq!(summary.created, 60);
    let paused = control.jobs().get(job.id).await?;
    assert_eq!(paused.synced_feedbacks, 60);
    assert_eq!(paused.processed_feedbacks, 60);
    assert_eq!(paused.current_page, 2);
    assert_eq!(paused.current_cursor, Some(50));
    assert_eq!(paused.shop_progress["alpha"]["created"], 60);
    assert_eq!(feedback_rows(&db).await?, 60);

    control.resume(job.id).await?;
    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.created, 40);
    assert_eq!(summary.unchanged, 10);
    let done = control.jobs().get(job.id).await?;
    assert_eq!(done.synced_feedbacks, 100);
    assert_eq!(feedback_rows(&db).await?, 100);
    Ok(())
}

#[tokio::test]
async fn realign_before_first_commit_reopens_current_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let token = CancellationToken::new();
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 150, 50))
            .cancel_on_fetch(2, token.clone()),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .with_cancellation(token)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;
    assert_eq!(summary.status, JobStatus::Paused);
    let paused = control.jobs().get(job.id).await?;
    assert_eq!(paused.current_connection_id, None);
    assert_eq!(paused.shop_progress["alpha"]["page_number"], 1);

    let realigned = control
        .update_resume_position(
            job.id,
            ResumeStrategy::FromDebugLog("page_number=2&cursor=50".to_string()),
        )
        .await?;
    assert_eq!(realigned.current_connection_id, Some(100));
    assert_eq!(realigned.current_shop_name, "alpha");
    assert_eq!(realigned.current_page, 3);
    assert_eq!(realigned.current_cursor, Some(50));
    assert_eq!(realigned.shop_progress["alpha"]["page_number"], 3);

    control.resume(job.id).await?;
    let before = seller.queries().len();
    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    assert_eq!(summary.status, JobStatus::Completed);
    let first = &seller.queries()[before];
    assert_eq!(first.page_number, 3);
    assert_eq!(first.cursor, 50);
    assert_eq!(summary.created, 50);
    Ok(())
}

#[tokio::test]
async fn debug_log_realigns_a_crashed_job() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(
        FakeSeller::new()
            .with_pages(100, pages_of(1, 150, 50))
            .failing(100, 2, ClientError::transient("timeout"), 2),
    );
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;
    pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    let job = control
        .update_resume_position(
            job.id,
            ResumeStrategy::FromDebugLog("page_number=2&cursor=79118132818".to_string()),
        )
        .await?;
    assert_eq!(job.current_page, 3);
    assert_eq!(job.current_cursor, Some(79118132818));
    assert_eq!(job.shop_progress["alpha"]["done"], false);

    control.resume(job.id).await?;
    let before = seller.queries().len();
    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await?;

    let resumed: Vec<_> = seller.queries()[before..].to_vec();
    assert_eq!(resumed[0].page_number, 3);
    assert_eq!(resumed[0].cursor, 79118132818);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.unchanged, 50);
    assert_eq!(feedback_rows(&db).await?, 100);
    Ok(())
}

#[tokio::test]
async fn auto_resume_skips_past_stored_reviews() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 150, 50)));
    let store = feedback_sync::repositories::FeedbackStore::new(db.clone());
    for id in 1..=50 {
        store.upsert(100, &review_json(id)).await?;
    }
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;

    let summary = pipeline(&db, registry(&shops), seller.clone(), None)
        .run_full_sync(
            job.id,
            FullSyncOptions {
                auto_resume_from_db: true,
            },
        )
        .await?;

    let queries = seller.queries();
    assert_eq!(queries[0].page_number, 2);
    assert_eq!(queries[0].cursor, 50);
    assert_eq!(summary.created, 100);
    Ok(())
}

#[tokio::test]
async fn running_job_cannot_be_started_twice() -> Result<()> {
    let db = setup_test_db().await?;
    let shops = [("alpha", 100)];
    let seller = Arc::new(FakeSeller::new());
    let control = control(&db, &shops, seller.clone());
    let job = control.create_full_sync(Some(365), 50, None).await?;
    control.jobs().set_status(job.id, JobStatus::Running).await?;

    let result = pipeline(&db, registry(&shops), seller, None)
        .run_full_sync(job.id, FullSyncOptions::default())
        .await;
    assert!(matches!(result, Err(PipelineError::InvalidJobState { .. })));
    Ok(())
}
