//! Migration to create the feedback_sync_jobs table.
//!
//! A sync job is the durable checkpoint of one crawl run: configuration,
//! position (shop index, page, cursor), counters and bounded rolling logs.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FeedbackSyncJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FeedbackSyncJobs::SyncType).string_len(20).not_null())
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::Status)
                            .string_len(20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(FeedbackSyncJobs::Days).integer().null())
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::PageSize)
                            .integer()
                            .not_null()
                            .default(50),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::MaxFeedbacksPerShop)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::BatchSize)
                            .integer()
                            .not_null()
                            .default(50),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::TotalShops)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CurrentShopIndex)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CurrentShopName)
                            .string_len(200)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CurrentConnectionId)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CurrentPage)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(FeedbackSyncJobs::CurrentCursor).big_integer().null())
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::LastProcessedFeedbackId)
                            .big_integer()
                            .null(),
                    )
                    .col(counter(FeedbackSyncJobs::TotalFeedbacks))
                    .col(counter(FeedbackSyncJobs::ProcessedFeedbacks))
                    .col(counter(FeedbackSyncJobs::SyncedFeedbacks))
                    .col(counter(FeedbackSyncJobs::UpdatedFeedbacks))
                    .col(counter(FeedbackSyncJobs::UnchangedFeedbacks))
                    .col(counter(FeedbackSyncJobs::ErrorCount))
                    .col(ColumnDef::new(FeedbackSyncJobs::ShopProgress).json_binary().not_null())
                    .col(ColumnDef::new(FeedbackSyncJobs::Logs).json_binary().not_null())
                    .col(ColumnDef::new(FeedbackSyncJobs::Errors).json_binary().not_null())
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(FeedbackSyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_feedback_sync_jobs_status_created")
                    .table(FeedbackSyncJobs::Table)
                    .col(FeedbackSyncJobs::Status)
                    .col(FeedbackSyncJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_feedback_sync_jobs_status_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(FeedbackSyncJobs::Table).to_owned())
            .await
    }
}

fn counter(column: FeedbackSyncJobs) -> ColumnDef {
    ColumnDef::new(column)
        .big_integer()
        .not_null()
        .default(0)
        .to_owned()
}

#[derive(DeriveIden)]
enum FeedbackSyncJobs {
    Table,
    Id,
    SyncType,
    Status,
    Days,
    PageSize,
    MaxFeedbacksPerShop,
    BatchSize,
    TotalShops,
    CurrentShopIndex,
    CurrentShopName,
    CurrentConnectionId,
    CurrentPage,
    CurrentCursor,
    LastProcessedFeedbackId,
    TotalFeedbacks,
    ProcessedFeedbacks,
    SyncedFeedbacks,
    UpdatedFeedbacks,
    UnchangedFeedbacks,
    ErrorCount,
    ShopProgress,
    Logs,
    Errors,
    StartedAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}
