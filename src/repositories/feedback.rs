//! # Feedback Store
//!
//! Idempotent upsert of seller-portal reviews keyed by `feedback_id`
//! (the portal's `comment_id`). Raw payloads are normalised, compared field by
//! field against the stored row, and only written when something mutable
//! changed. Rows whose ERP linkage is incomplete are handed to the [`Linker`].

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info};

use crate::clients::id_i64;
use crate::error::{PipelineError, is_unique_violation};
use crate::linker::Linker;
use crate::models::feedback::{ActiveModel, Column, Entity, Model};
use crate::models::feedback_log::FeedbackAction;
use crate::normalization::{
    MAX_BUYER_NAME, MAX_ORDER_REF, MAX_PORTRAIT, MAX_PRODUCT_COVER, MAX_PRODUCT_NAME,
    bare_cdn_id, extract_reply, normalize_media, product_image_url, truncate_chars,
};
use crate::repositories::feedback_log::{self, NewFeedbackLog};

/// `status_reply` of a review that carries a seller reply.
pub const STATUS_REPLIED: &str = "replied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        }
    }
}

/// A review payload in stored form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReview {
    pub feedback_id: i64,
    pub connection_id: i64,
    pub item_id: Option<i64>,
    pub product_id: Option<i64>,
    pub model_id: Option<i64>,
    pub model_name: Option<String>,
    pub product_name: String,
    pub product_cover: Option<String>,
    pub product_image: Option<String>,
    pub channel_order_number: Option<String>,
    pub order_id: Option<i64>,
    pub buyer_user_name: String,
    pub user_portrait: Option<String>,
    pub user_id: Option<i64>,
    pub rating: i32,
    pub comment: String,
    pub images: JsonValue,
    pub reply: String,
    pub reply_time: Option<i64>,
    pub status_reply: Option<String>,
    pub is_hidden: bool,
    pub status: Option<i32>,
    pub can_follow_up: Option<bool>,
    pub follow_up: Option<String>,
    pub submit_time: Option<i64>,
    pub create_time: i64,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}

impl NormalizedReview {
    /// Normalises one raw review. Fails with `DataShape` when `comment_id` is
    /// missing or a typed field holds something unparseable.
    pub fn from_value(connection_id: i64, raw: &JsonValue) -> Result<Self, PipelineError> {
        if !raw.is_object() {
            return Err(PipelineError::data_shape("review is not an object"));
        }
        let feedback_id = raw
            .get("comment_id")
            .and_then(id_i64)
            .ok_or_else(|| PipelineError::data_shape("review has no comment_id"))?;

        let rating = opt_int(raw, "rating_star")?
            .ok_or_else(|| PipelineError::data_shape("review has no rating_star"))?;
        let rating = i32::try_from(rating)
            .ok()
            .filter(|stars| (1..=5).contains(stars))
            .ok_or_else(|| {
                PipelineError::data_shape(format!("rating_star {rating} is not between 1 and 5"))
            })?;
        let status = opt_int(raw, "status")?
            .map(|s| {
                i32::try_from(s)
                    .map_err(|_| PipelineError::data_shape(format!("status {s} out of range")))
            })
            .transpose()?;

        let reply = extract_reply(raw.get("reply").unwrap_or(&JsonValue::Null));
        let status_reply = (!reply.text.is_empty()).then(|| STATUS_REPLIED.to_string());

        let media = match (raw.get("images"), raw.get("videos")) {
            (images, Some(videos)) if !videos.is_null() => json!({
                "images": images.cloned().unwrap_or(JsonValue::Null),
                "videos": videos,
            }),
            (Some(images), _) => images.clone(),
            (None, _) => JsonValue::Null,
        };

        let cover_raw = opt_text(raw, "product_cover");
        let product_cover = cover_raw
            .as_deref()
            .and_then(bare_cdn_id)
            .map(|id| truncate_chars(&id, MAX_PRODUCT_COVER));
        let product_image = cover_raw.as_deref().and_then(product_image_url);

        let ctime = opt_int(raw, "ctime")?;
        let submit_time = opt_int(raw, "submit_time")?;

        Ok(Self {
            feedback_id,
            connection_id,
            item_id: opt_int(raw, "item_id")?,
            product_id: opt_int(raw, "product_id")?,
            model_id: opt_int(raw, "model_id")?,
            model_name: opt_text(raw, "model_name"),
            product_name: truncate_chars(
                &opt_text(raw, "product_name").unwrap_or_default(),
                MAX_PRODUCT_NAME,
            ),
            product_cover,
            product_image,
            channel_order_number: opt_text(raw, "order_sn")
                .map(|sn| truncate_chars(&sn, MAX_ORDER_REF)),
            order_id: opt_int(raw, "order_id")?,
            buyer_user_name: truncate_chars(
                &opt_text(raw, "user_name").unwrap_or_default(),
                MAX_BUYER_NAME,
            ),
            user_portrait: opt_text(raw, "user_portrait")
                .as_deref()
                .and_then(bare_cdn_id)
                .map(|id| truncate_chars(&id, MAX_PORTRAIT)),
            user_id: opt_int(raw, "user_id")?,
            rating,
            comment: opt_text(raw, "comment").unwrap_or_default(),
            images: JsonValue::from(normalize_media(&media)),
            reply: reply.text,
            reply_time: reply.time,
            status_reply,
            is_hidden: opt_flag(raw, "is_hidden")?.unwrap_or(false),
            status,
            can_follow_up: opt_flag(raw, "can_follow_up")?,
            follow_up: opt_text(raw, "follow_up"),
            submit_time,
            create_time: ctime.or(submit_time).unwrap_or(0),
            ctime,
            mtime: opt_int(raw, "mtime")?,
        })
    }

    /// Names of mutable fields that differ from `stored`.
    pub fn changed_fields(&self, stored: &Model) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let mut check = |name: &'static str, differs: bool| {
            if differs {
                changed.push(name);
            }
        };
        check("rating", self.rating != stored.rating);
        check("comment", self.comment != stored.comment);
        check("reply", self.reply != stored.reply);
        check("reply_time", self.reply_time != stored.reply_time);
        check("status_reply", self.status_reply != stored.status_reply);
        check("images", self.images != stored.images);
        check("is_hidden", self.is_hidden != stored.is_hidden);
        check("status", self.status != stored.status);
        check("can_follow_up", self.can_follow_up != stored.can_follow_up);
        check("follow_up", self.follow_up != stored.follow_up);
        check("submit_time", self.submit_time != stored.submit_time);
        check("ctime", self.ctime != stored.ctime);
        check("mtime", self.mtime != stored.mtime);
        check("product_name", self.product_name != stored.product_name);
        check("product_cover", self.product_cover != stored.product_cover);
        check("product_image", self.product_image != stored.product_image);
        check("buyer_user_name", self.buyer_user_name != stored.buyer_user_name);
        check("user_portrait", self.user_portrait != stored.user_portrait);
        check(
            "channel_order_number",
            self.channel_order_number != stored.channel_order_number,
        );
        changed
    }

    fn into_insert(self) -> ActiveModel {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: NotSet,
            feedback_id: Set(self.feedback_id),
            comment_id: Set(Some(self.feedback_id)),
            connection_id: Set(self.connection_id),
            item_id: Set(self.item_id),
            product_id: Set(self.product_id),
            model_id: Set(self.model_id),
            model_name: Set(self.model_name),
            product_name: Set(self.product_name),
            product_cover: Set(self.product_cover),
            product_image: Set(self.product_image),
            channel_order_number: Set(self.channel_order_number),
            order_id: Set(self.order_id),
            buyer_user_name: Set(self.buyer_user_name),
            user_portrait: Set(self.user_portrait),
            user_id: Set(self.user_id),
            rating: Set(self.rating),
            comment: Set(self.comment),
            images: Set(self.images),
            reply: Set(self.reply),
            reply_time: Set(self.reply_time),
            status_reply: Set(self.status_reply),
            is_hidden: Set(self.is_hidden),
            status: Set(self.status),
            can_follow_up: Set(self.can_follow_up),
            follow_up: Set(self.follow_up),
            submit_time: Set(self.submit_time),
            create_time: Set(self.create_time),
            ctime: Set(self.ctime),
            mtime: Set(self.mtime),
            erp_order_id: Set(None),
            erp_customer_id: Set(None),
            erp_product_id: Set(None),
            erp_variant_id: Set(None),
            link_attempted_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    /// Copies the mutable fields onto `stored`. Identity and creation time
    /// are left alone.
    fn apply_to(self, stored: Model) -> ActiveModel {
        let mut active: ActiveModel = stored.into();
        active.rating = Set(self.rating);
        active.comment = Set(self.comment);
        active.reply = Set(self.reply);
        active.reply_time = Set(self.reply_time);
        active.status_reply = Set(self.status_reply);
        active.images = Set(self.images);
        active.is_hidden = Set(self.is_hidden);
        active.status = Set(self.status);
        active.can_follow_up = Set(self.can_follow_up);
        active.follow_up = Set(self.follow_up);
        active.submit_time = Set(self.submit_time);
        active.ctime = Set(self.ctime);
        active.mtime = Set(self.mtime);
        active.product_name = Set(self.product_name);
        active.product_cover = Set(self.product_cover);
        active.product_image = Set(self.product_image);
        active.buyer_user_name = Set(self.buyer_user_name);
        active.user_portrait = Set(self.user_portrait);
        active.channel_order_number = Set(self.channel_order_number);
        active.updated_at = Set(Utc::now().fixed_offset());
        active
    }
}

fn opt_int(raw: &JsonValue, key: &str) -> Result<Option<i64>, PipelineError> {
    match raw.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(value) => id_i64(value)
            .map(Some)
            .ok_or_else(|| PipelineError::data_shape(format!("{key} is not an integer: {value}"))),
    }
}

fn opt_flag(raw: &JsonValue, key: &str) -> Result<Option<bool>, PipelineError> {
    match raw.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(JsonValue::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" | "" => Ok(Some(false)),
            _ => Err(PipelineError::data_shape(format!("{key} is not a flag: {s}"))),
        },
        Some(other) => Err(PipelineError::data_shape(format!(
            "{key} is not a flag: {other}"
        ))),
    }
}

/// Text value of `key`; structured values are kept as their JSON text.
fn opt_text(raw: &JsonValue, key: &str) -> Option<String> {
    match raw.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Repository owning every write to the `feedbacks` table.
#[derive(Clone)]
pub struct FeedbackStore {
    db: DatabaseConnection,
    linker: Option<Arc<Linker>>,
}

impl FeedbackStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db, linker: None }
    }

    /// Store that hands incompletely linked rows to `linker` after upsert.
    pub fn with_linker(mut self, linker: Arc<Linker>) -> Self {
        self.linker = Some(linker);
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Inserts or refreshes one raw review pulled for `connection_id`.
    pub async fn upsert(
        &self,
        connection_id: i64,
        raw: &JsonValue,
    ) -> Result<UpsertOutcome, PipelineError> {
        let review = NormalizedReview::from_value(connection_id, raw)?;
        let feedback_id = review.feedback_id;

        let (outcome, row) = match self.find_by_feedback_id(feedback_id).await? {
            None => match review.clone().into_insert().insert(&self.db).await {
                Ok(row) => (UpsertOutcome::Created, row),
                Err(e) if is_unique_violation(&e) => {
                    // inserted concurrently; fall through to the update path
                    let stored = self
                        .find_by_feedback_id(feedback_id)
                        .await?
                        .ok_or(PipelineError::Database(e))?;
                    self.refresh(review, stored).await?
                }
                Err(e) => {
                    error!(feedback_id, error = %e, "Failed to insert feedback");
                    return Err(e.into());
                }
            },
            Some(stored) => self.refresh(review, stored).await?,
        };

        metrics::counter!("feedback_upserts_total", "outcome" => outcome.as_str()).increment(1);
        debug!(feedback_id, connection_id, outcome = outcome.as_str(), "Feedback upserted");

        if let Some(linker) = &self.linker {
            let relink = match outcome {
                UpsertOutcome::Created | UpsertOutcome::Updated => row.linkage_incomplete(),
                // a run interrupted between upsert and link left the row unvisited
                UpsertOutcome::Unchanged => {
                    row.linkage_incomplete() && row.link_attempted_at.is_none()
                }
            };
            if relink {
                linker.link(&self.db, row).await?;
            }
        }

        Ok(outcome)
    }

    async fn refresh(
        &self,
        review: NormalizedReview,
        stored: Model,
    ) -> Result<(UpsertOutcome, Model), PipelineError> {
        let changed = review.changed_fields(&stored);
        if changed.is_empty() {
            return Ok((UpsertOutcome::Unchanged, stored));
        }

        let feedback_id = stored.feedback_id;
        let row = review.apply_to(stored).update(&self.db).await.map_err(|e| {
            error!(feedback_id, error = %e, "Failed to update feedback");
            e
        })?;
        debug!(feedback_id, fields = ?changed, "Feedback fields changed");
        Ok((UpsertOutcome::Updated, row))
    }

    pub async fn find_by_feedback_id(&self, feedback_id: i64) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::FeedbackId.eq(feedback_id))
            .one(&self.db)
            .await
    }

    pub async fn exists(&self, feedback_id: i64) -> Result<bool, DbErr> {
        let count = Entity::find()
            .filter(Column::FeedbackId.eq(feedback_id))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn count_for_connection(&self, connection_id: i64) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .count(&self.db)
            .await
    }

    /// Newest stored feedback of a shop by marketplace creation time.
    pub async fn latest_for_connection(&self, connection_id: i64) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_desc(Column::CreateTime)
            .order_by_desc(Column::FeedbackId)
            .one(&self.db)
            .await
    }

    /// Newest stored feedback across all shops.
    pub async fn latest(&self) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .order_by_desc(Column::CreateTime)
            .order_by_desc(Column::FeedbackId)
            .one(&self.db)
            .await
    }

    /// Largest stored `create_time` across all shops.
    pub async fn max_create_time(&self) -> Result<Option<i64>, DbErr> {
        let newest = Entity::find()
            .select_only()
            .column(Column::CreateTime)
            .order_by_desc(Column::CreateTime)
            .limit(1)
            .into_tuple::<i64>()
            .one(&self.db)
            .await?;
        Ok(newest)
    }

    /// Stores a reply locally and logs it. Posting to the seller portal is
    /// done elsewhere.
    pub async fn record_reply(
        &self,
        feedback_id: i64,
        text: &str,
        user_name: &str,
        reply_time: Option<i64>,
    ) -> Result<Model, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "reply text must not be empty".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let stored = Entity::find()
            .filter(Column::FeedbackId.eq(feedback_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidArgument(format!("feedback {feedback_id} does not exist"))
            })?;

        let rating = stored.rating;
        let mut active: ActiveModel = stored.into();
        active.reply = Set(text.to_string());
        active.reply_time = Set(Some(reply_time.unwrap_or_else(|| Utc::now().timestamp())));
        active.status_reply = Set(Some(STATUS_REPLIED.to_string()));
        active.updated_at = Set(Utc::now().fixed_offset());
        let row = active.update(&txn).await?;

        let mut entry = NewFeedbackLog::system(row.id, FeedbackAction::Reply)
            .with_data(json!({ "reply": text }))
            .with_note(text);
        entry.user_name = user_name.to_string();
        entry.rating_before = Some(rating);
        entry.rating_after = Some(rating);
        feedback_log::append(&txn, entry).await?;

        txn.commit().await?;
        info!(feedback_id, user = user_name, "Reply recorded");
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review() -> JsonValue {
        json!({
            "comment_id": "79118132818",
            "order_sn": "25112099T2CASS",
            "item_id": 1234,
            "product_name": "Kettle",
            "product_cover": "https://cf.shopee.vn/file/vn-abc",
            "rating_star": 5,
            "comment": "great",
            "images": ["img1"],
            "reply": "{'comment': 'thanks', 'ctime': 1764654168}",
            "is_hidden": 0,
            "ctime": 1764000000,
            "user_name": "buyer",
            "user_portrait": "https://down-vn.img.susercontent.com/file/portrait1"
        })
    }

    #[test]
    fn normalises_wire_review() {
        let r = NormalizedReview::from_value(100, &review()).unwrap();
        assert_eq!(r.feedback_id, 79118132818);
        assert_eq!(r.rating, 5);
        assert_eq!(r.reply, "thanks");
        assert_eq!(r.reply_time, Some(1764654168));
        assert_eq!(r.status_reply.as_deref(), Some(STATUS_REPLIED));
        assert_eq!(r.images, json!(["https://cf.shopee.vn/file/img1"]));
        assert_eq!(r.product_cover.as_deref(), Some("vn-abc"));
        assert_eq!(
            r.product_image.as_deref(),
            Some("https://cf.shopee.vn/file/vn-abc")
        );
        assert_eq!(r.user_portrait.as_deref(), Some("portrait1"));
        assert_eq!(r.channel_order_number.as_deref(), Some("25112099T2CASS"));
        assert_eq!(r.create_time, 1764000000);
        assert!(!r.is_hidden);
    }

    #[test]
    fn missing_comment_id_is_data_shape() {
        let mut raw = review();
        raw.as_object_mut().unwrap().remove("comment_id");
        assert!(matches!(
            NormalizedReview::from_value(100, &raw),
            Err(PipelineError::DataShape { .. })
        ));
    }

    #[test]
    fn unparseable_rating_is_data_shape() {
        let mut raw = review();
        raw["rating_star"] = json!("five");
        assert!(matches!(
            NormalizedReview::from_value(100, &raw),
            Err(PipelineError::DataShape { .. })
        ));
    }

    #[test]
    fn rating_outside_one_to_five_is_data_shape() {
        for stars in [json!(0), json!(7), json!(-1), JsonValue::Null] {
            let mut raw = review();
            raw["rating_star"] = stars;
            assert!(matches!(
                NormalizedReview::from_value(100, &raw),
                Err(PipelineError::DataShape { .. })
            ));
        }

        let mut raw = review();
        raw.as_object_mut().unwrap().remove("rating_star");
        assert!(NormalizedReview::from_value(100, &raw).is_err());

        let mut raw = review();
        raw["rating_star"] = json!(1);
        assert_eq!(NormalizedReview::from_value(100, &raw).unwrap().rating, 1);
    }

    #[test]
    fn long_names_are_truncated() {
        let mut raw = review();
        raw["product_name"] = json!("x".repeat(1500));
        raw["user_name"] = json!("y".repeat(300));
        let r = NormalizedReview::from_value(100, &raw).unwrap();
        assert_eq!(r.product_name.chars().count(), MAX_PRODUCT_NAME);
        assert_eq!(r.buyer_user_name.chars().count(), MAX_BUYER_NAME);
    }
}
