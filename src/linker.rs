//! # Linker
//!
//! Attaches ERP `(order, customer, variant, product)` ids to a stored
//! feedback. Variants are matched against the order's line items directly by
//! marketplace item id, then through the [`VariantIndex`] built from catalogue
//! metadata. Remote failures are absorbed: whatever was resolved before the
//! failure is kept and the row stays partially linked.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, Set, TransactionTrait};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clients::{ClientError, ErpApi, ErpOrder};
use crate::models::feedback::{ActiveModel, Model};
use crate::models::feedback_log::FeedbackAction;
use crate::repositories::feedback_log::{self, NewFeedbackLog};
use crate::variant_index::{VariantIndex, VariantIndexHandle};

/// Result of one linker pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Order and variant were already set; nothing was fetched
    AlreadyLinked,
    /// No order reference, or the ERP has no such order
    Unlinked,
    /// Order (and customer) linked, no line item matched the reviewed item
    OrderOnly,
    /// Variant (and product) linked
    Linked,
    /// A remote call failed; earlier results were kept
    Degraded,
}

impl LinkOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            LinkOutcome::AlreadyLinked => "already_linked",
            LinkOutcome::Unlinked => "unlinked",
            LinkOutcome::OrderOnly => "order_only",
            LinkOutcome::Linked => "linked",
            LinkOutcome::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ErpIds {
    order_id: Option<i64>,
    customer_id: Option<i64>,
    variant_id: Option<i64>,
    product_id: Option<i64>,
}

impl ErpIds {
    fn of(feedback: &Model) -> Self {
        Self {
            order_id: feedback.erp_order_id,
            customer_id: feedback.erp_customer_id,
            variant_id: feedback.erp_variant_id,
            product_id: feedback.erp_product_id,
        }
    }
}

pub struct Linker {
    erp: Arc<dyn ErpApi>,
    index: VariantIndexHandle,
}

impl Linker {
    pub fn new(erp: Arc<dyn ErpApi>) -> Self {
        Self::with_index(erp, VariantIndexHandle::new())
    }

    pub fn with_index(erp: Arc<dyn ErpApi>, index: VariantIndexHandle) -> Self {
        Self { erp, index }
    }

    pub fn index(&self) -> &VariantIndexHandle {
        &self.index
    }

    /// Links `feedback` and persists the result. Only database failures
    /// surface as errors.
    pub async fn link(&self, db: &DatabaseConnection, feedback: Model) -> Result<LinkOutcome, DbErr> {
        if feedback.erp_order_id.is_some() && feedback.erp_variant_id.is_some() {
            return Ok(LinkOutcome::AlreadyLinked);
        }

        let before = ErpIds::of(&feedback);
        let mut ids = before;
        let outcome = self.resolve(&feedback, &mut ids).await;
        metrics::counter!("feedback_links_total", "result" => outcome.as_str()).increment(1);

        let feedback_id = feedback.feedback_id;
        let row_id = feedback.id;
        let txn = db.begin().await?;
        let mut active: ActiveModel = feedback.into();
        active.erp_order_id = Set(ids.order_id);
        active.erp_customer_id = Set(ids.customer_id);
        active.erp_variant_id = Set(ids.variant_id);
        active.erp_product_id = Set(ids.product_id);
        active.link_attempted_at = Set(Some(Utc::now().timestamp()));
        active.update(&txn).await?;

        let newly_linked = (before.order_id.is_none() && ids.order_id.is_some())
            || (before.variant_id.is_none() && ids.variant_id.is_some());
        if newly_linked {
            let data = json!({
                "erp_order_id": ids.order_id,
                "erp_customer_id": ids.customer_id,
                "erp_variant_id": ids.variant_id,
                "erp_product_id": ids.product_id,
            });
            let entry = NewFeedbackLog::system(row_id, FeedbackAction::Link)
                .with_data(data)
                .with_note(outcome.as_str());
            feedback_log::append(&txn, entry).await?;
        }
        txn.commit().await?;

        if newly_linked {
            info!(
                feedback_id,
                erp_order_id = ?ids.order_id,
                erp_variant_id = ?ids.variant_id,
                "Feedback linked to ERP"
            );
        }
        Ok(outcome)
    }

    async fn resolve(&self, feedback: &Model, ids: &mut ErpIds) -> LinkOutcome {
        let feedback_id = feedback.feedback_id;
        let Some(reference) = feedback
            .channel_order_number
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
        else {
            debug!(feedback_id, "No order reference on feedback; not linked");
            return LinkOutcome::Unlinked;
        };

        let order = match self.erp.find_order_by_reference(reference).await {
            Ok(Some(order)) => order,
            Ok(None) | Err(ClientError::NotFound { .. }) => {
                debug!(feedback_id, reference, "ERP order not found");
                return LinkOutcome::Unlinked;
            }
            Err(e) => {
                warn!(feedback_id, reference, error = %e, "ERP order lookup failed");
                return LinkOutcome::Degraded;
            }
        };

        ids.order_id = Some(order.id);
        if ids.customer_id.is_none() {
            ids.customer_id = order.customer_id;
        }

        let order = if order.line_items.is_empty() {
            match self.erp.get_order_dto(order.id).await {
                Ok(full) => full,
                Err(e) => {
                    warn!(feedback_id, order_id = order.id, error = %e, "ERP order fetch failed");
                    return LinkOutcome::Degraded;
                }
            }
        } else {
            order
        };
        if ids.customer_id.is_none() {
            ids.customer_id = order.customer_id;
        }

        if ids.variant_id.is_some() {
            return LinkOutcome::Linked;
        }
        let Some(channel_item_id) = feedback.item_id.map(|id| id.to_string()) else {
            debug!(feedback_id, "Feedback has no item id; variant not linked");
            return LinkOutcome::OrderOnly;
        };

        let matches = self
            .matching_variants(&order, feedback.connection_id, &channel_item_id)
            .await;
        let Some(&variant_id) = matches.first() else {
            debug!(
                feedback_id,
                order_id = order.id,
                item_id = %channel_item_id,
                "No order line matches the reviewed item"
            );
            return LinkOutcome::OrderOnly;
        };
        if matches.len() > 1 {
            debug!(feedback_id, variants = ?matches, "Several line items match; keeping the first");
        }

        match self.erp.get_variant(variant_id).await {
            Ok(variant) => {
                ids.variant_id = Some(variant.id);
                ids.product_id = variant.product_id;
                LinkOutcome::Linked
            }
            Err(ClientError::NotFound { .. }) => {
                debug!(feedback_id, variant_id, "ERP variant not found");
                LinkOutcome::OrderOnly
            }
            Err(e) => {
                warn!(feedback_id, variant_id, error = %e, "ERP variant fetch failed");
                LinkOutcome::Degraded
            }
        }
    }

    /// Variant ids of the order's line items that sell `channel_item_id`,
    /// in line item order.
    async fn matching_variants(
        &self,
        order: &ErpOrder,
        connection_id: i64,
        channel_item_id: &str,
    ) -> Vec<i64> {
        let mut index: Option<&VariantIndex> = None;
        let mut found = Vec::new();
        for line in &order.line_items {
            let Some(variant_id) = line.variant_id else {
                continue;
            };
            if line.matches_channel_item(channel_item_id) {
                found.push(variant_id);
                continue;
            }
            let idx = match index {
                Some(idx) => idx,
                None => *index.insert(self.index.get(self.erp.as_ref()).await),
            };
            if idx.contains(connection_id, channel_item_id, variant_id) {
                found.push(variant_id);
            }
        }
        found
    }
}
