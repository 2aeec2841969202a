//! Migration to create the feedback_logs table.
//!
//! Append-only audit trail of actions taken on a feedback (reply, link,
//! auto-created ticket).

use sea_orm_migration::prelude::*;

use crate::m2025_11_10_000100_create_feedbacks::Feedbacks;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FeedbackLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FeedbackLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FeedbackLogs::FeedbackRowId).big_integer().not_null())
                    .col(ColumnDef::new(FeedbackLogs::ActionType).string_len(50).not_null())
                    .col(ColumnDef::new(FeedbackLogs::ActionData).json_binary().null())
                    .col(
                        ColumnDef::new(FeedbackLogs::UserName)
                            .string_len(200)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(FeedbackLogs::RatingBefore).integer().null())
                    .col(ColumnDef::new(FeedbackLogs::RatingAfter).integer().null())
                    .col(ColumnDef::new(FeedbackLogs::Note).text().not_null().default(""))
                    .col(
                        ColumnDef::new(FeedbackLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_feedback_logs_feedback_row_id")
                            .from(FeedbackLogs::Table, FeedbackLogs::FeedbackRowId)
                            .to(Feedbacks::Table, Feedbacks::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_feedback_logs_feedback_created")
                    .table(FeedbackLogs::Table)
                    .col(FeedbackLogs::FeedbackRowId)
                    .col(FeedbackLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_feedback_logs_feedback_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(FeedbackLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FeedbackLogs {
    Table,
    Id,
    FeedbackRowId,
    ActionType,
    ActionData,
    UserName,
    RatingBefore,
    RatingAfter,
    Note,
    CreatedAt,
}
