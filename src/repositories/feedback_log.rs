//! # FeedbackLog Repository
//!
//! Append-only writer for the feedback action log. Functions take any
//! [`ConnectionTrait`] so entries can be written inside the caller's
//! transaction.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;

use crate::models::feedback_log::{ActiveModel, Column, Entity, FeedbackAction, Model};

/// User name recorded for entries written by the pipeline itself.
pub const SYSTEM_USER: &str = "system";

/// Entry to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedbackLog {
    pub feedback_row_id: i64,
    pub action: FeedbackAction,
    pub action_data: Option<JsonValue>,
    pub user_name: String,
    pub rating_before: Option<i32>,
    pub rating_after: Option<i32>,
    pub note: String,
}

impl NewFeedbackLog {
    pub fn system(feedback_row_id: i64, action: FeedbackAction) -> Self {
        Self {
            feedback_row_id,
            action,
            action_data: None,
            user_name: SYSTEM_USER.to_string(),
            rating_before: None,
            rating_after: None,
            note: String::new(),
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.action_data = Some(data);
        self
    }

    pub fn with_note<S: Into<String>>(mut self, note: S) -> Self {
        self.note = note.into();
        self
    }
}

pub async fn append<C: ConnectionTrait>(conn: &C, entry: NewFeedbackLog) -> Result<Model, DbErr> {
    let row = ActiveModel {
        id: NotSet,
        feedback_row_id: Set(entry.feedback_row_id),
        action_type: Set(entry.action.as_str().to_string()),
        action_data: Set(entry.action_data),
        user_name: Set(entry.user_name),
        rating_before: Set(entry.rating_before),
        rating_after: Set(entry.rating_after),
        note: Set(entry.note),
        created_at: Set(Utc::now().fixed_offset()),
    };

    row.insert(conn).await.map_err(|e| {
        tracing::error!(
            feedback_row_id = entry.feedback_row_id,
            action = entry.action.as_str(),
            error = %e,
            "Failed to append feedback log"
        );
        e
    })
}

/// Entries for one feedback row, oldest first.
pub async fn list_for_feedback<C: ConnectionTrait>(
    conn: &C,
    feedback_row_id: i64,
) -> Result<Vec<Model>, DbErr> {
    Entity::find()
        .filter(Column::FeedbackRowId.eq(feedback_row_id))
        .order_by_asc(Column::CreatedAt)
        .order_by_asc(Column::Id)
        .all(conn)
        .await
}
