//! Feedback entity model
//!
//! One row per marketplace review. `feedback_id` is the seller portal's
//! `comment_id` and is unique across all shops.

use super::feedback_log::Entity as FeedbackLog;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "feedbacks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// External review id (`comment_id` on the seller portal)
    #[sea_orm(unique)]
    pub feedback_id: i64,

    /// Kept for historical records that predate the id unification
    pub comment_id: Option<i64>,

    /// Shop connection the review was pulled from
    pub connection_id: i64,

    pub item_id: Option<i64>,
    pub product_id: Option<i64>,
    pub model_id: Option<i64>,
    pub model_name: Option<String>,
    pub product_name: String,

    /// Bare CDN id of the product cover
    pub product_cover: Option<String>,

    /// Full product image URL derived from the cover id
    pub product_image: Option<String>,

    /// Marketplace order number (`order_sn`)
    pub channel_order_number: Option<String>,

    pub order_id: Option<i64>,
    pub buyer_user_name: String,

    /// Bare CDN id of the buyer portrait, never a full URL
    pub user_portrait: Option<String>,

    pub user_id: Option<i64>,
    pub rating: i32,
    pub comment: String,

    /// Normalised media URLs
    #[sea_orm(column_type = "JsonBinary")]
    pub images: JsonValue,

    pub reply: String,
    pub reply_time: Option<i64>,
    pub status_reply: Option<String>,
    pub is_hidden: bool,
    pub status: Option<i32>,
    pub can_follow_up: Option<bool>,
    pub follow_up: Option<String>,
    pub submit_time: Option<i64>,

    /// Creation time on the marketplace (seconds since epoch), immutable
    pub create_time: i64,

    pub ctime: Option<i64>,
    pub mtime: Option<i64>,

    pub erp_order_id: Option<i64>,
    pub erp_customer_id: Option<i64>,
    pub erp_product_id: Option<i64>,
    pub erp_variant_id: Option<i64>,

    /// Seconds since epoch of the last linker pass over this row
    pub link_attempted_at: Option<i64>,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Whether the ERP linkage still has gaps worth another linker pass.
    pub fn linkage_incomplete(&self) -> bool {
        self.erp_order_id.is_none() || self.erp_variant_id.is_none()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "FeedbackLog")]
    FeedbackLog,
}

impl Related<FeedbackLog> for Entity {
    fn to() -> RelationDef {
        Relation::FeedbackLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
