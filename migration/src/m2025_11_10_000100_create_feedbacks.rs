//! Migration to create the feedbacks table.
//!
//! One row per marketplace review, keyed by the external `feedback_id`
//! (the seller portal's `comment_id`), with nullable ERP linkage columns.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Feedbacks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Feedbacks::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Feedbacks::FeedbackId).big_integer().not_null())
                    .col(ColumnDef::new(Feedbacks::CommentId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ConnectionId).big_integer().not_null())
                    .col(ColumnDef::new(Feedbacks::ItemId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ProductId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ModelId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ModelName).text().null())
                    .col(
                        ColumnDef::new(Feedbacks::ProductName)
                            .string_len(1000)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Feedbacks::ProductCover).string_len(200).null())
                    .col(ColumnDef::new(Feedbacks::ProductImage).text().null())
                    .col(
                        ColumnDef::new(Feedbacks::ChannelOrderNumber)
                            .string_len(100)
                            .null(),
                    )
                    .col(ColumnDef::new(Feedbacks::OrderId).big_integer().null())
                    .col(
                        ColumnDef::new(Feedbacks::BuyerUserName)
                            .string_len(200)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Feedbacks::UserPortrait).string_len(200).null())
                    .col(ColumnDef::new(Feedbacks::UserId).big_integer().null())
                    .col(
                        ColumnDef::new(Feedbacks::Rating)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Feedbacks::Comment).text().not_null().default(""))
                    .col(ColumnDef::new(Feedbacks::Images).json_binary().not_null())
                    .col(ColumnDef::new(Feedbacks::Reply).text().not_null().default(""))
                    .col(ColumnDef::new(Feedbacks::ReplyTime).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::StatusReply).text().null())
                    .col(
                        ColumnDef::new(Feedbacks::IsHidden)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Feedbacks::Status).integer().null())
                    .col(ColumnDef::new(Feedbacks::CanFollowUp).boolean().null())
                    .col(ColumnDef::new(Feedbacks::FollowUp).text().null())
                    .col(ColumnDef::new(Feedbacks::SubmitTime).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::CreateTime).big_integer().not_null())
                    .col(ColumnDef::new(Feedbacks::Ctime).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::Mtime).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ErpOrderId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ErpCustomerId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ErpProductId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::ErpVariantId).big_integer().null())
                    .col(ColumnDef::new(Feedbacks::LinkAttemptedAt).big_integer().null())
                    .col(
                        ColumnDef::new(Feedbacks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Feedbacks::UpdatedAt)
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
                    .name("uq_feedbacks_feedback_id")
                    .table(Feedbacks::Table)
                    .col(Feedbacks::FeedbackId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Per-shop scans: counts, newest feedback, incremental watermark
        manager
            .create_index(
                Index::create()
                    .name("idx_feedbacks_connection_create_time")
                    .table(Feedbacks::Table)
                    .col(Feedbacks::ConnectionId)
                    .col(Feedbacks::CreateTime)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_feedbacks_channel_order_number")
                    .table(Feedbacks::Table)
                    .col(Feedbacks::ChannelOrderNumber)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_feedbacks_channel_order_number").to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_feedbacks_connection_create_time")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("uq_feedbacks_feedback_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Feedbacks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Feedbacks {
    Table,
    Id,
    FeedbackId,
    CommentId,
    ConnectionId,
    ItemId,
    ProductId,
    ModelId,
    ModelName,
    ProductName,
    ProductCover,
    ProductImage,
    ChannelOrderNumber,
    OrderId,
    BuyerUserName,
    UserPortrait,
    UserId,
    Rating,
    Comment,
    Images,
    Reply,
    ReplyTime,
    StatusReply,
    IsHidden,
    Status,
    CanFollowUp,
    FollowUp,
    SubmitTime,
    CreateTime,
    Ctime,
    Mtime,
    ErpOrderId,
    ErpCustomerId,
    ErpProductId,
    ErpVariantId,
    LinkAttemptedAt,
    CreatedAt,
    UpdatedAt,
}
