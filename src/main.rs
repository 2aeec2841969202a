//! # Feedback Sync Entry Point
//!
//! Operator CLI: runs full and incremental syncs and repairs job positions.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use feedback_sync::clients::seller::load_sessions;
use feedback_sync::clients::{ErpApi, SapoClient, SellerApi, ShopeeClient};
use feedback_sync::config::{AppConfig, ConfigLoader};
use feedback_sync::db::{init_pool, run_migrations};
use feedback_sync::error::PipelineError;
use feedback_sync::jobs::{JobControl, ResumeStrategy};
use feedback_sync::linker::Linker;
use feedback_sync::models::sync_job::JobStatus;
use feedback_sync::shops::ShopRegistry;
use feedback_sync::sync::{
    CheckpointFile, FullSyncOptions, PipelineSettings, SyncPipeline, SyncSummary,
};
use feedback_sync::telemetry::init_tracing;

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "feedback-sync", version, about = "Shop review ingestion and ERP linking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backfill reviews of every shop over a day window
    #[command(name = "sync_feedbacks_full")]
    SyncFeedbacksFull {
        #[arg(long, default_value_t = 365)]
        days: i32,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
        #[arg(long)]
        max_feedbacks_per_shop: Option<i64>,
        /// Continue an existing job instead of creating one
        #[arg(long)]
        resume_job_id: Option<i64>,
        #[arg(long)]
        auto_resume_from_db: bool,
    },
    /// Fetch reviews newer than the newest stored one
    #[command(name = "sync_feedbacks_incremental")]
    SyncFeedbacksIncremental {
        #[arg(long, default_value_t = 50)]
        batch_size: u32,
    },
    #[command(name = "reset_job_shop_index")]
    ResetJobShopIndex {
        #[arg(long)]
        job_id: i64,
        #[arg(long)]
        keep_page_cursor: bool,
    },
    #[command(name = "update_job_resume_position")]
    UpdateJobResumePosition {
        #[arg(long)]
        job_id: i64,
        #[arg(long, value_enum, default_value_t = ResumeMethod::FromLogs)]
        method: ResumeMethod,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        cursor: Option<i64>,
        #[arg(long)]
        feedback_id: Option<i64>,
        /// `page_number=N&cursor=C` copied from a request log
        #[arg(long)]
        parse_debug_log: Option<String>,
    },
    #[command(name = "estimate_job_resume_position")]
    EstimateJobResumePosition {
        #[arg(long)]
        job_id: i64,
        #[arg(long)]
        total_reviews: Option<u64>,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    #[command(name = "job_status")]
    JobStatus {
        #[arg(long)]
        job_id: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum ResumeMethod {
    FromFeedbackId,
    FromLogs,
    Manual,
    FromDebugLog,
}

impl ResumeMethod {
    fn strategy(
        self,
        page: Option<u32>,
        cursor: Option<i64>,
        feedback_id: Option<i64>,
        debug_log: Option<String>,
    ) -> anyhow::Result<ResumeStrategy> {
        Ok(match self {
            ResumeMethod::Manual => {
                let (Some(page), Some(cursor)) = (page, cursor) else {
                    anyhow::bail!("--method manual requires --page and --cursor");
                };
                ResumeStrategy::Manual { page, cursor }
            }
            ResumeMethod::FromDebugLog => ResumeStrategy::FromDebugLog(
                debug_log.context("--method from_debug_log requires --parse-debug-log")?,
            ),
            ResumeMethod::FromLogs => ResumeStrategy::FromLogs(debug_log),
            ResumeMethod::FromFeedbackId => ResumeStrategy::FromFeedbackId(feedback_id),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;
    info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    run_migrations(&db).await?;

    let settings = PipelineSettings::from_config(&config)?;
    let registry = Arc::new(
        ShopRegistry::from_path(&config.shops_file)
            .with_context(|| format!("loading shops from {}", config.shops_file.display()))?,
    );
    let seller: Arc<dyn SellerApi> = Arc::new(ShopeeClient::new(
        config.seller_api_base.clone(),
        Duration::from_secs(config.seller_request_timeout_secs),
        load_sessions(&registry),
    )?);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; pausing after the current review");
            interrupt.cancel();
        }
    });

    let control = JobControl::new(db.clone(), registry.clone(), seller.clone(), settings.clone())
        .with_cancellation(cancel.clone());

    match cli.command {
        Command::SyncFeedbacksFull {
            days,
            page_size,
            max_feedbacks_per_shop,
            resume_job_id,
            auto_resume_from_db,
        } => {
            let job = match resume_job_id {
                Some(job_id) => control.resume(job_id).await?,
                None => {
                    control
                        .create_full_sync(Some(days), page_size, max_feedbacks_per_shop)
                        .await?
                }
            };
            let pipeline = build_pipeline(&config, db, registry, seller, settings, cancel)?;
            let result = pipeline
                .run_full_sync(job.id, FullSyncOptions { auto_resume_from_db })
                .await;
            report_run(&control, job.id, result).await
        }
        Command::SyncFeedbacksIncremental { batch_size } => {
            let job = control.create_incremental_sync(batch_size).await?;
            let pipeline = build_pipeline(&config, db, registry, seller, settings, cancel)?;
            let result = pipeline.run_incremental_sync(job.id).await;
            report_run(&control, job.id, result).await
        }
        Command::ResetJobShopIndex {
            job_id,
            keep_page_cursor,
        } => {
            control.reset_shop_index(job_id, keep_page_cursor).await?;
            print_status(&control, job_id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::UpdateJobResumePosition {
            job_id,
            method,
            page,
            cursor,
            feedback_id,
            parse_debug_log,
        } => {
            let strategy = method.strategy(page, cursor, feedback_id, parse_debug_log)?;
            control.update_resume_position(job_id, strategy).await?;
            print_status(&control, job_id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::EstimateJobResumePosition {
            job_id,
            total_reviews,
            page_size,
        } => {
            let estimate = control
                .estimate_resume_position(job_id, total_reviews, page_size)
                .await?;
            println!("{estimate}");
            Ok(ExitCode::SUCCESS)
        }
        Command::JobStatus { job_id } => {
            print_status(&control, job_id).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_pipeline(
    config: &AppConfig,
    db: DatabaseConnection,
    registry: Arc<ShopRegistry>,
    seller: Arc<dyn SellerApi>,
    settings: PipelineSettings,
    cancel: CancellationToken,
) -> anyhow::Result<SyncPipeline> {
    let linker = match &config.erp_api_base {
        Some(base) => {
            let erp: Arc<dyn ErpApi> = Arc::new(SapoClient::new(
                base.clone(),
                config.erp_access_token.clone(),
                Duration::from_secs(config.seller_request_timeout_secs),
            )?);
            Some(Arc::new(Linker::new(erp)))
        }
        None => {
            warn!("No ERP configured; feedbacks will be stored unlinked");
            None
        }
    };

    let mut pipeline = SyncPipeline::new(db, registry, seller, linker, settings.clone())
        .with_cancellation(cancel);
    if let Some(path) = &config.checkpoint_path {
        pipeline = pipeline.with_checkpoint(CheckpointFile::new(path, settings.tz));
    }
    Ok(pipeline)
}

async fn report_run(
    control: &JobControl,
    job_id: i64,
    result: Result<SyncSummary, PipelineError>,
) -> anyhow::Result<ExitCode> {
    let code = match &result {
        Ok(summary) => {
            println!("{}", summary.one_line());
            match summary.status {
                JobStatus::Paused => ExitCode::from(EXIT_INTERRUPTED),
                _ => ExitCode::SUCCESS,
            }
        }
        Err(e) => {
            eprintln!("job {job_id} failed: {e}");
            ExitCode::from(EXIT_FAILED)
        }
    };
    print_status(control, job_id).await?;
    Ok(code)
}

async fn print_status(control: &JobControl, job_id: i64) -> anyhow::Result<()> {
    let view = control.status_view(job_id).await?;
    println!("{view}");
    Ok(())
}
