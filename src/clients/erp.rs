//! ERP (Sapo) client
//!
//! Only the lookups the linker and the variant index need: orders by
//! marketplace reference, single orders and variants, and paging over the
//! active product catalogue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use super::{ClientError, id_i64, id_string};

/// Largest catalogue page requested from the ERP.
pub const MAX_PRODUCT_PAGE: u32 = 250;

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_i64))
}

fn de_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    id_i64(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErpOrder {
    #[serde(deserialize_with = "de_id")]
    pub id: i64,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub location_id: Option<i64>,
    #[serde(default, alias = "order_line_items")]
    pub line_items: Vec<ErpLineItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErpLineItem {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub variant_id: Option<i64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub item_id: Option<JsonValue>,
    #[serde(default)]
    pub product_item_id: Option<JsonValue>,
    #[serde(default)]
    pub sku: Option<String>,
}

impl ErpLineItem {
    /// Whether this line carries the marketplace item id `channel_item_id`.
    pub fn matches_channel_item(&self, channel_item_id: &str) -> bool {
        [&self.item_id, &self.product_item_id]
            .into_iter()
            .flatten()
            .filter_map(id_string)
            .any(|id| id == channel_item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErpVariant {
    #[serde(deserialize_with = "de_id")]
    pub id: i64,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErpProduct {
    #[serde(deserialize_with = "de_id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Structured metadata when the ERP exposes it directly
    #[serde(default)]
    pub gdp_metadata: Option<JsonValue>,
}

#[async_trait]
pub trait ErpApi: Send + Sync {
    /// Order whose marketplace reference is `reference`, if any.
    async fn find_order_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ErpOrder>, ClientError>;

    async fn get_order_dto(&self, order_id: i64) -> Result<ErpOrder, ClientError>;

    async fn get_variant(&self, variant_id: i64) -> Result<ErpVariant, ClientError>;

    /// One catalogue page; `limit` is capped at [`MAX_PRODUCT_PAGE`].
    async fn list_products(
        &self,
        page: u32,
        limit: u32,
        status: &str,
    ) -> Result<Vec<ErpProduct>, ClientError>;
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<ErpOrder>,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: ErpOrder,
}

#[derive(Debug, Deserialize)]
struct VariantEnvelope {
    variant: ErpVariant,
}

#[derive(Debug, Deserialize)]
struct ProductsEnvelope {
    #[serde(default)]
    products: Vec<ErpProduct>,
}

/// reqwest-backed [`ErpApi`] against the Sapo admin API.
pub struct SapoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl SapoClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::permanent(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            access_token,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        context: &str,
    ) -> Result<T, ClientError> {
        let endpoint = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let url = reqwest::Url::parse_with_params(&endpoint, params)
            .map_err(|e| ClientError::permanent(format!("invalid ERP url: {e}")))?;

        let mut req = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = &self.access_token {
            req = req.header("X-Sapo-Access-Token", token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::from_status(resp.status(), context));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ErpApi for SapoClient {
    async fn find_order_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ErpOrder>, ClientError> {
        let envelope: OrdersEnvelope = self
            .get_json(
                "orders.json",
                &[
                    ("query", reference.to_string()),
                    ("limit", "1".to_string()),
                    ("page", "1".to_string()),
                ],
                "order lookup",
            )
            .await?;
        Ok(envelope.orders.into_iter().next())
    }

    async fn get_order_dto(&self, order_id: i64) -> Result<ErpOrder, ClientError> {
        let envelope: OrderEnvelope = self
            .get_json(&format!("orders/{order_id}.json"), &[], "order fetch")
            .await?;
        Ok(envelope.order)
    }

    async fn get_variant(&self, variant_id: i64) -> Result<ErpVariant, ClientError> {
        let envelope: VariantEnvelope = self
            .get_json(&format!("variants/{variant_id}.json"), &[], "variant fetch")
            .await?;
        Ok(envelope.variant)
    }

    async fn list_products(
        &self,
        page: u32,
        limit: u32,
        status: &str,
    ) -> Result<Vec<ErpProduct>, ClientError> {
        let envelope: ProductsEnvelope = self
            .get_json(
                "products.json",
                &[
                    ("page", page.to_string()),
                    ("limit", limit.clamp(1, MAX_PRODUCT_PAGE).to_string()),
                    ("status", status.to_string()),
                ],
                "product listing",
            )
            .await?;
        Ok(envelope.products)
    }
}
