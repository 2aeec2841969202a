//! # Variant Reverse Index
//!
//! Maps `(connection_id, channel_item_id)` to the ERP variants that sell that
//! marketplace listing. The data comes from the GDP product metadata kept in
//! the ERP catalogue: each variant record lists its `shopee_connections`.
//!
//! The index is built lazily on first lookup and at most once per
//! [`VariantIndexHandle`]; afterwards it is read-only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::clients::erp::MAX_PRODUCT_PAGE;
use crate::clients::{ErpApi, ErpProduct, id_i64, id_string};

static GDP_META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[GDP_META\](.*?)\[/GDP_META\]").expect("valid GDP_META regex")
});

/// Upper bound on catalogue pages walked by one build.
const MAX_CATALOGUE_PAGES: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantIndex {
    map: HashMap<(i64, String), HashSet<i64>>,
}

impl VariantIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection_id: i64, channel_item_id: impl Into<String>, variant_id: i64) {
        self.map
            .entry((connection_id, channel_item_id.into()))
            .or_default()
            .insert(variant_id);
    }

    /// Variants for a listing; empty when unknown.
    pub fn resolve(&self, connection_id: i64, channel_item_id: &str) -> HashSet<i64> {
        self.map
            .get(&(connection_id, channel_item_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, connection_id: i64, channel_item_id: &str, variant_id: i64) -> bool {
        self.map
            .get(&(connection_id, channel_item_id.to_string()))
            .is_some_and(|set| set.contains(&variant_id))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Adds every `shopee_connections` entry of a product's variants.
    /// Products without metadata contribute nothing.
    pub fn add_product(&mut self, product: &ErpProduct) {
        let Some(meta) = product_metadata(product) else {
            return;
        };
        let Some(variants) = meta.get("variants").and_then(JsonValue::as_array) else {
            return;
        };

        for variant in variants {
            let Some(variant_id) = variant.get("id").and_then(id_i64) else {
                continue;
            };
            let connections = variant
                .get("shopee_connections")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for conn in connections {
                let connection_id = conn.get("connection_id").and_then(id_i64);
                let item_id = conn.get("item_id").and_then(id_string);
                if let (Some(connection_id), Some(item_id)) = (connection_id, item_id) {
                    self.insert(connection_id, item_id, variant_id);
                }
            }
        }
    }

    /// Walks the active catalogue page by page until a short page.
    pub async fn build(erp: &dyn ErpApi) -> Result<Self, crate::clients::ClientError> {
        let mut index = Self::new();
        let mut products_seen = 0usize;
        for page in 1..=MAX_CATALOGUE_PAGES {
            let products = erp.list_products(page, MAX_PRODUCT_PAGE, "active").await?;
            products_seen += products.len();
            for product in &products {
                index.add_product(product);
            }
            if products.len() < MAX_PRODUCT_PAGE as usize {
                break;
            }
        }
        info!(
            products = products_seen,
            listings = index.len(),
            "Variant index built"
        );
        Ok(index)
    }
}

/// GDP metadata of a product: the structured field if present, otherwise the
/// `[GDP_META]{json}[/GDP_META]` block embedded in the description.
pub fn product_metadata(product: &ErpProduct) -> Option<JsonValue> {
    if let Some(meta) = product.gdp_metadata.as_ref().filter(|m| m.is_object()) {
        return Some(meta.clone());
    }
    let description = product.description.as_deref()?;
    let block = GDP_META_RE.captures(description)?.get(1)?.as_str().trim();
    match serde_json::from_str::<JsonValue>(block) {
        Ok(meta) if meta.is_object() => Some(meta),
        Ok(_) => None,
        Err(e) => {
            warn!(product_id = product.id, error = %e, "Invalid GDP_META block");
            None
        }
    }
}

/// Lazily built, shared index. Clones share the same cell.
#[derive(Clone, Default)]
pub struct VariantIndexHandle {
    cell: Arc<OnceCell<VariantIndex>>,
    builds: Arc<AtomicUsize>,
}

impl VariantIndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle over an index that is already built.
    pub fn prebuilt(index: VariantIndex) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(index))),
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the index, building it on first call. A failed build leaves
    /// an empty index that is not retried.
    pub async fn get(&self, erp: &dyn ErpApi) -> &VariantIndex {
        self.cell
            .get_or_init(|| async {
                self.builds.fetch_add(1, Ordering::SeqCst);
                match VariantIndex::build(erp).await {
                    Ok(index) => index,
                    Err(e) => {
                        warn!(error = %e, "Variant index build failed; lookups degrade to empty");
                        VariantIndex::new()
                    }
                }
            })
            .await
    }

    /// Number of builds started through this handle.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn is_built(&self) -> bool {
        self.cell.initialized()
    }
}
