//! Test utilities: in-memory database, fake remotes and review fixtures.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::FixedOffset;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

use feedback_sync::clients::{
    ClientError, ErpApi, ErpOrder, ErpProduct, ErpVariant, RatingsPage, RatingsQuery, SellerApi,
};
use feedback_sync::config::SyncConfig;
use feedback_sync::linker::Linker;
use feedback_sync::shops::{Shop, ShopRegistry};
use feedback_sync::sync::{PipelineSettings, SyncPipeline};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Fixture log rows may reference feedbacks that were never inserted.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Settings with no pacing or backoff so tests run instantly.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        sync: SyncConfig {
            page_retry_attempts: 2,
            page_retry_backoff_ms: 0,
            inter_page_delay_ms: 0,
            ..SyncConfig::default()
        },
        language: "vi".to_string(),
        tz: FixedOffset::east_opt(7 * 3600).unwrap(),
    }
}

pub fn registry(shops: &[(&str, i64)]) -> Arc<ShopRegistry> {
    Arc::new(ShopRegistry::new(
        shops
            .iter()
            .map(|(name, connection_id)| Shop {
                name: name.to_string(),
                connection_id: *connection_id,
                credentials_handle: None,
                seller_shop_id: None,
            })
            .collect(),
    ))
}

pub fn pipeline(
    db: &DatabaseConnection,
    shops: Arc<ShopRegistry>,
    seller: Arc<FakeSeller>,
    linker: Option<Arc<Linker>>,
) -> SyncPipeline {
    SyncPipeline::new(db.clone(), shops, seller, linker, test_settings())
}

/// A wire review as the seller portal returns it.
pub fn review_json(comment_id: i64) -> JsonValue {
    json!({
        "comment_id": comment_id,
        "order_id": 9_000 + comment_id,
        "order_sn": format!("SN{comment_id}"),
        "item_id": 1234,
        "product_id": 1234,
        "model_id": 55,
        "product_name": "Kem chống nắng",
        "product_cover": "vn-11134207-7qukw-abc",
        "rating_star": 5,
        "comment": format!("review {comment_id}"),
        "images": ["https://down-vn.img.susercontent.com/file/img-1"],
        "reply": null,
        "is_hidden": false,
        "status": 1,
        "submit_time": 1_700_000_000 + comment_id,
        "ctime": 1_700_000_000 + comment_id,
        "mtime": 1_700_000_000 + comment_id,
        "user_name": "buyer",
        "user_portrait": "https://down-vn.img.susercontent.com/file/portrait-1",
        "user_id": 77,
    })
}

/// Pages of `page_size` consecutive reviews starting at `first_id`.
pub fn pages_of(first_id: i64, count: usize, page_size: usize) -> Vec<Vec<JsonValue>> {
    let reviews: Vec<JsonValue> = (0..count as i64).map(|i| review_json(first_id + i)).collect();
    reviews.chunks(page_size).map(<[JsonValue]>::to_vec).collect()
}

/// Scripted seller portal. Pages are served by `page_number`; the cursor is
/// recorded but not interpreted.
#[derive(Default)]
pub struct FakeSeller {
    pages: Mutex<HashMap<i64, Vec<Vec<JsonValue>>>>,
    totals: Mutex<HashMap<i64, u64>>,
    failures: Mutex<HashMap<(i64, u32), VecDeque<ClientError>>>,
    queries: Mutex<Vec<RatingsQuery>>,
    probes: AtomicUsize,
    cancel_on_fetch: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeSeller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(self, connection_id: i64, pages: Vec<Vec<JsonValue>>) -> Self {
        self.pages.lock().unwrap().insert(connection_id, pages);
        self
    }

    pub fn with_total(self, connection_id: i64, total: u64) -> Self {
        self.totals.lock().unwrap().insert(connection_id, total);
        self
    }

    /// Fail `page_number` of `connection_id` `times` times with `error`.
    pub fn failing(self, connection_id: i64, page_number: u32, error: ClientError, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry((connection_id, page_number))
            .or_default()
            .extend(std::iter::repeat_n(error, times));
        self
    }

    /// Cancel `token` when the `nth` page fetch (1-based) is served.
    pub fn cancel_on_fetch(self, nth: usize, token: CancellationToken) -> Self {
        *self.cancel_on_fetch.lock().unwrap() = Some((nth, token));
        self
    }

    pub fn queries(&self) -> Vec<RatingsQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn fetches_for(&self, connection_id: i64) -> Vec<u32> {
        self.queries()
            .iter()
            .filter(|q| q.connection_id == connection_id)
            .map(|q| q.page_number)
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SellerApi for FakeSeller {
    async fn bind(&self, _connection_id: i64) -> Result<(), ClientError> {
        Ok(())
    }

    async fn fetch_ratings(&self, query: &RatingsQuery) -> Result<RatingsPage, ClientError> {
        let served = {
            let mut queries = self.queries.lock().unwrap();
            queries.push(query.clone());
            queries.len()
        };
        if let Some((nth, token)) = self.cancel_on_fetch.lock().unwrap().as_ref()
            && served == *nth
        {
            token.cancel();
        }

        let key = (query.connection_id, query.page_number);
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let items = self
            .pages
            .lock()
            .unwrap()
            .get(&query.connection_id)
            .and_then(|pages| pages.get(query.page_number as usize - 1))
            .cloned()
            .unwrap_or_default();
        Ok(RatingsPage {
            items,
            total: None,
            response_code: 0,
            message: "success".to_string(),
        })
    }

    async fn probe_total(
        &self,
        connection_id: i64,
        _window: (Option<i64>, Option<i64>),
        _language: &str,
    ) -> Result<u64, ClientError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(total) = self.totals.lock().unwrap().get(&connection_id) {
            return Ok(*total);
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&connection_id)
            .map(|pages| pages.iter().map(Vec::len).sum::<usize>() as u64)
            .unwrap_or(0))
    }
}

/// Scripted ERP.
#[derive(Default)]
pub struct FakeErp {
    orders_by_reference: HashMap<String, ErpOrder>,
    orders: HashMap<i64, ErpOrder>,
    variants: HashMap<i64, ErpVariant>,
    products: Vec<ErpProduct>,
    failing_lookup: bool,
    failing_catalogue: bool,
    product_pages: AtomicUsize,
    order_lookups: AtomicUsize,
    cancel_on_lookup: Option<(usize, CancellationToken)>,
}

impl FakeErp {
    pub fn new() -> Self {
        Self::default()
    }

    /// `order` is returned for `reference` and by id.
    pub fn with_order(mut self, reference: &str, order: JsonValue) -> Self {
        let order: ErpOrder = serde_json::from_value(order).unwrap();
        self.orders.insert(order.id, order.clone());
        self.orders_by_reference.insert(reference.to_string(), order);
        self
    }

    /// Full order returned by `get_order_dto`, overriding the lookup result.
    pub fn with_order_detail(mut self, order: JsonValue) -> Self {
        let order: ErpOrder = serde_json::from_value(order).unwrap();
        self.orders.insert(order.id, order);
        self
    }

    pub fn with_variant(mut self, variant_id: i64, product_id: i64) -> Self {
        self.variants.insert(
            variant_id,
            serde_json::from_value(json!({"id": variant_id, "product_id": product_id})).unwrap(),
        );
        self
    }

    pub fn with_product(mut self, product: JsonValue) -> Self {
        self.products.push(serde_json::from_value(product).unwrap());
        self
    }

    pub fn failing_order_lookup(mut self) -> Self {
        self.failing_lookup = true;
        self
    }

    /// `list_products` fails on every page.
    pub fn failing_catalogue(mut self) -> Self {
        self.failing_catalogue = true;
        self
    }

    /// Cancel `token` during the `nth` order lookup (1-based).
    pub fn cancel_on_lookup(mut self, nth: usize, token: CancellationToken) -> Self {
        self.cancel_on_lookup = Some((nth, token));
        self
    }

    pub fn product_page_calls(&self) -> usize {
        self.product_pages.load(Ordering::SeqCst)
    }

    pub fn order_lookup_calls(&self) -> usize {
        self.order_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ErpApi for FakeErp {
    async fn find_order_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ErpOrder>, ClientError> {
        let served = self.order_lookups.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((nth, token)) = &self.cancel_on_lookup
            && served == *nth
        {
            token.cancel();
        }
        if self.failing_lookup {
            return Err(ClientError::transient("erp unavailable"));
        }
        Ok(self.orders_by_reference.get(reference).cloned())
    }

    async fn get_order_dto(&self, order_id: i64) -> Result<ErpOrder, ClientError> {
        self.orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                message: format!("order {order_id}"),
            })
    }

    async fn get_variant(&self, variant_id: i64) -> Result<ErpVariant, ClientError> {
        self.variants
            .get(&variant_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                message: format!("variant {variant_id}"),
            })
    }

    async fn list_products(
        &self,
        page: u32,
        limit: u32,
        _status: &str,
    ) -> Result<Vec<ErpProduct>, ClientError> {
        self.product_pages.fetch_add(1, Ordering::SeqCst);
        if self.failing_catalogue {
            return Err(ClientError::transient("catalogue unavailable"));
        }
        let start = (page.saturating_sub(1) * limit) as usize;
        Ok(self
            .products
            .iter()
            .skip(start)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
