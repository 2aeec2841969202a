//! FeedbackLog entity model
//!
//! Append-only record of actions taken on a feedback.

use super::feedback::Entity as Feedback;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "feedback_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Row id of the feedback (not the external `feedback_id`)
    pub feedback_row_id: i64,

    /// One of [`FeedbackAction::as_str`]
    pub action_type: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub action_data: Option<JsonValue>,

    pub user_name: String,
    pub rating_before: Option<i32>,
    pub rating_after: Option<i32>,
    pub note: String,
    pub created_at: DateTimeWithTimeZone,
}

/// Kinds of feedback actions recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackAction {
    Reply,
    Link,
    AutoCreateTicket,
}

impl FeedbackAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            FeedbackAction::Reply => "reply",
            FeedbackAction::Link => "link",
            FeedbackAction::AutoCreateTicket => "create_ticket",
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Feedback",
        from = "Column::FeedbackRowId",
        to = "super::feedback::Column::Id"
    )]
    Feedback,
}

impl Related<Feedback> for Entity {
    fn to() -> RelationDef {
        Relation::Feedback.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
