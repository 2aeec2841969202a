//! Operator commands over persisted sync jobs.

use std::sync::Arc;

use anyhow::Result;
use feedback_sync::error::PipelineError;
use feedback_sync::jobs::{JobControl, ResumeStrategy};
use feedback_sync::models::sync_job::{JobStatus, Model as SyncJob};
use feedback_sync::repositories::FeedbackStore;
use feedback_sync::repositories::sync_job::{JobPosition, ProgressUpdate};
use feedback_sync::sync::full::ShopProgress;
use sea_orm::DatabaseConnection;

mod test_utils;
use test_utils::{FakeSeller, pages_of, registry, review_json, setup_test_db, test_settings};

const SHOPS: [(&str, i64); 2] = [("alpha", 100), ("beta", 200)];

fn control(db: &DatabaseConnection, seller: Arc<FakeSeller>) -> JobControl {
    JobControl::new(db.clone(), registry(&SHOPS), seller, test_settings())
}

async fn place(
    control: &JobControl,
    job_id: i64,
    index: i32,
    page: i32,
    cursor: Option<i64>,
) -> Result<SyncJob> {
    let (name, connection_id) = SHOPS[index as usize];
    Ok(control
        .jobs()
        .update_job_progress(
            job_id,
            ProgressUpdate {
                position: Some(JobPosition {
                    shop_index: index,
                    shop_name: name.to_string(),
                    connection_id: Some(connection_id),
                    page,
                    cursor,
                }),
                ..ProgressUpdate::default()
            },
        )
        .await?)
}

#[tokio::test]
async fn create_full_sync_validates_arguments() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));

    assert!(matches!(
        control.create_full_sync(Some(30), 0, None).await,
        Err(PipelineError::InvalidArgument(_))
    ));
    assert!(matches!(
        control.create_full_sync(Some(30), 50, Some(-1)).await,
        Err(PipelineError::InvalidArgument(_))
    ));

    let job = control.create_full_sync(Some(30), 200, Some(10)).await?;
    assert_eq!(job.page_size, 50);
    assert_eq!(job.total_shops, 2);
    assert_eq!(job.status, "pending");
    assert_eq!(job.current_page, 1);
    assert_eq!(job.max_feedbacks_per_shop, Some(10));
    assert_eq!(job.sync_type, "full");
    Ok(())
}

#[tokio::test]
async fn resume_gating_follows_job_status() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;

    let pending = control.resume(job.id).await?;
    assert_eq!(pending.status, "pending");
    assert_eq!(pending.log_lines().len(), 0);

    control.jobs().set_status(job.id, JobStatus::Running).await?;
    assert!(matches!(
        control.resume(job.id).await,
        Err(PipelineError::InvalidJobState { .. })
    ));

    control.jobs().set_status(job.id, JobStatus::Paused).await?;
    let resumed = control.resume(job.id).await?;
    assert_eq!(resumed.status, "pending");
    assert!(resumed.log_lines()[0].contains("Resumed from paused"));

    control.jobs().set_status(job.id, JobStatus::Failed).await?;
    assert_eq!(control.resume(job.id).await?.status, "pending");

    control.jobs().set_status(job.id, JobStatus::Completed).await?;
    assert!(matches!(
        control.resume(job.id).await,
        Err(PipelineError::InvalidJobState { .. })
    ));

    place(&control, job.id, 0, 4, Some(150)).await?;
    let reopened = control.resume(job.id).await?;
    assert_eq!(reopened.status, "pending");
    assert!(reopened.completed_at.is_none());

    assert!(matches!(
        control.resume(9_999).await,
        Err(PipelineError::JobNotFound { job_id: 9_999 })
    ));
    Ok(())
}

#[tokio::test]
async fn reset_shop_index_optionally_keeps_position() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;
    place(&control, job.id, 1, 4, Some(99)).await?;
    control
        .jobs()
        .update_job_progress(
            job.id,
            ProgressUpdate {
                shop_progress: Some(("beta".to_string(), ShopProgress::new(200).to_json()?)),
                ..ProgressUpdate::default()
            },
        )
        .await?;

    let kept = control.reset_shop_index(job.id, true).await?;
    assert_eq!(kept.current_shop_index, 0);
    assert_eq!(kept.current_page, 4);
    assert_eq!(kept.current_cursor, Some(99));
    assert!(kept.shop_progress.get("beta").is_some());

    let cleared = control.reset_shop_index(job.id, false).await?;
    assert_eq!(cleared.current_shop_index, 0);
    assert_eq!(cleared.current_page, 1);
    assert_eq!(cleared.current_cursor, None);
    assert_eq!(cleared.current_connection_id, None);
    assert_eq!(cleared.shop_progress, serde_json::json!({}));
    assert_eq!(
        cleared
            .log_lines()
            .iter()
            .filter(|l| l.contains("Shop index reset"))
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn manual_position_reopens_the_current_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;
    place(&control, job.id, 1, 9, Some(1)).await?;
    let mut done = ShopProgress::new(200);
    done.done = true;
    done.fetched = 400;
    control
        .jobs()
        .update_job_progress(
            job.id,
            ProgressUpdate {
                shop_progress: Some(("beta".to_string(), done.to_json()?)),
                ..ProgressUpdate::default()
            },
        )
        .await?;

    let job = control
        .update_resume_position(job.id, ResumeStrategy::Manual { page: 5, cursor: 777 })
        .await?;

    assert_eq!(job.current_page, 5);
    assert_eq!(job.current_cursor, Some(777));
    assert_eq!(job.current_shop_index, 1);
    assert_eq!(job.current_shop_name, "beta");
    let progress = ShopProgress::restore(&job.shop_progress["beta"], 200).expect("entry");
    assert_eq!(progress.page_number, 5);
    assert_eq!(progress.cursor, 777);
    assert_eq!(progress.fetched, 400);
    assert!(!progress.done);

    assert!(matches!(
        control
            .update_resume_position(job.id, ResumeStrategy::Manual { page: 0, cursor: 1 })
            .await,
        Err(PipelineError::InvalidArgument(_))
    ));
    Ok(())
}

#[tokio::test]
async fn position_from_logs_prefers_current_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;

    let empty = control
        .update_resume_position(job.id, ResumeStrategy::FromLogs(None))
        .await;
    assert!(matches!(empty, Err(PipelineError::InvalidArgument(_))));

    place(&control, job.id, 1, 2, Some(20)).await?;
    control
        .jobs()
        .update_job_progress(
            job.id,
            ProgressUpdate {
                log_messages: vec![
                    "alpha: Page 7 | Cursor 70 | 50 reviews".to_string(),
                    "beta: Page 3 | Cursor 30 | 50 reviews".to_string(),
                    "alpha: Page 8 | Cursor 80 | 50 reviews".to_string(),
                ],
                ..ProgressUpdate::default()
            },
        )
        .await?;

    let job = control
        .update_resume_position(job.id, ResumeStrategy::FromLogs(None))
        .await?;
    assert_eq!(job.current_page, 4);
    assert_eq!(job.current_cursor, Some(30));

    let job = control
        .update_resume_position(
            job.id,
            ResumeStrategy::FromLogs(Some(
                "GET /api/v3/settings/search_shop_rating_comments?page_number=11&cursor=5150&page_size=50"
                    .to_string(),
            )),
        )
        .await?;
    assert_eq!(job.current_page, 12);
    assert_eq!(job.current_cursor, Some(5150));

    assert!(matches!(
        control
            .update_resume_position(job.id, ResumeStrategy::FromDebugLog("cursor=1".to_string()))
            .await,
        Err(PipelineError::Cursor(_))
    ));
    Ok(())
}

#[tokio::test]
async fn position_from_feedback_id_crawls_current_shop() -> Result<()> {
    let db = setup_test_db().await?;
    let seller = Arc::new(FakeSeller::new().with_pages(100, pages_of(1, 150, 50)));
    let control = control(&db, seller.clone());
    let job = control.create_full_sync(Some(30), 50, None).await?;

    assert!(matches!(
        control
            .update_resume_position(job.id, ResumeStrategy::FromFeedbackId(Some(75)))
            .await,
        Err(PipelineError::InvalidArgument(_))
    ));

    place(&control, job.id, 0, 1, None).await?;
    let job = control
        .update_resume_position(job.id, ResumeStrategy::FromFeedbackId(Some(75)))
        .await?;
    assert_eq!(job.current_page, 3);
    assert_eq!(job.current_cursor, Some(100));
    assert_eq!(seller.fetches_for(100), vec![1, 2]);

    FeedbackStore::new(db.clone())
        .upsert(100, &review_json(120))
        .await?;
    let job = control
        .update_resume_position(job.id, ResumeStrategy::FromFeedbackId(None))
        .await?;
    assert_eq!(job.current_page, 4);
    assert_eq!(job.current_cursor, Some(150));

    let missing = control
        .update_resume_position(job.id, ResumeStrategy::FromFeedbackId(Some(9_999)))
        .await;
    assert!(matches!(missing, Err(PipelineError::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn estimate_does_not_touch_the_job() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;
    place(&control, job.id, 0, 1, None).await?;
    let store = FeedbackStore::new(db.clone());
    for id in 1..=120 {
        store.upsert(100, &review_json(id)).await?;
    }

    let estimate = control.estimate_resume_position(job.id, None, 50).await?;
    assert_eq!(estimate.total_reviews, 120);
    assert!(estimate.counted_from_store);
    assert_eq!(estimate.estimated_page, 4);
    assert_eq!(estimate.estimated_cursor, Some(120));
    assert!(estimate.to_string().contains("estimated page: 4"));

    let given = control
        .estimate_resume_position(job.id, Some(1_000), 50)
        .await?;
    assert_eq!(given.estimated_page, 21);
    assert!(!given.counted_from_store);

    let unchanged = control.jobs().get(job.id).await?;
    assert_eq!(unchanged.current_page, 1);
    assert_eq!(unchanged.current_cursor, None);

    assert!(control.estimate_resume_position(job.id, None, 0).await.is_err());
    Ok(())
}

#[tokio::test]
async fn estimate_cursor_falls_back_to_newest_feedback() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;
    place(&control, job.id, 1, 1, None).await?;
    FeedbackStore::new(db.clone())
        .upsert(100, &review_json(33))
        .await?;

    let estimate = control.estimate_resume_position(job.id, None, 50).await?;
    assert_eq!(estimate.connection_id, 200);
    assert_eq!(estimate.total_reviews, 0);
    assert_eq!(estimate.estimated_page, 1);
    assert_eq!(estimate.estimated_cursor, Some(33));
    Ok(())
}

#[tokio::test]
async fn status_view_shows_recent_lines() -> Result<()> {
    let db = setup_test_db().await?;
    let control = control(&db, Arc::new(FakeSeller::new()));
    let job = control.create_full_sync(Some(30), 50, None).await?;
    control
        .jobs()
        .update_job_progress(
            job.id,
            ProgressUpdate {
                log_messages: (0..60).map(|i| format!("line {i}")).collect(),
                error_messages: vec!["alpha: page 2 skipped: timeout".to_string()],
                errors: 1,
                ..ProgressUpdate::default()
            },
        )
        .await?;

    let view = control.status_view(job.id).await?;
    assert_eq!(view.recent_logs.len(), 50);
    assert!(view.recent_logs.last().unwrap().ends_with("line 59"));
    assert_eq!(view.recent_errors.len(), 1);
    assert_eq!(view.error_count, 1);

    let text = view.to_string();
    assert!(text.starts_with(&format!("Job {} [full] pending", job.id)));
    assert!(text.contains("page 2 skipped"));
    Ok(())
}
