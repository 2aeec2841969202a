//! Seller portal ratings client
//!
//! Cursor-paged fetch of shop ratings. A client holds one pre-authenticated
//! session per shop connection and swaps between them on [`SellerApi::bind`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::ClientError;
use crate::cursor::PageCursor;
use crate::shops::ShopRegistry;

/// Largest page the ratings endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 50;

/// Star filter requesting every rating.
pub const ALL_RATING_STARS: &str = "5,4,3,2,1";

const RATINGS_PATH: &str = "settings/search_shop_rating_comments_new/";

/// Parameters of one ratings page request.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingsQuery {
    pub connection_id: i64,
    pub rating_stars: String,
    /// Seconds since epoch; `None` leaves the bound open
    pub time_start: Option<i64>,
    pub time_end: Option<i64>,
    pub page_number: u32,
    pub page_size: u32,
    pub cursor: i64,
    pub from_page_number: u32,
    pub language: String,
}

impl RatingsQuery {
    /// Builds a request for the page `position` points at. `page_size` is
    /// clamped to [`MAX_PAGE_SIZE`].
    pub fn at(
        connection_id: i64,
        window: (Option<i64>, Option<i64>),
        position: &PageCursor,
        page_size: u32,
        language: &str,
    ) -> Self {
        Self {
            connection_id,
            rating_stars: ALL_RATING_STARS.to_string(),
            time_start: window.0,
            time_end: window.1,
            page_number: position.page_number,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            cursor: position.cursor,
            from_page_number: position.from_page_number,
            language: language.to_string(),
        }
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("rating_star".to_string(), self.rating_stars.clone())];
        if let Some(start) = self.time_start {
            pairs.push(("time_start".to_string(), start.to_string()));
        }
        if let Some(end) = self.time_end {
            pairs.push(("time_end".to_string(), end.to_string()));
        }
        pairs.extend([
            ("page_number".to_string(), self.page_number.to_string()),
            ("page_size".to_string(), self.page_size.to_string()),
            ("cursor".to_string(), self.cursor.to_string()),
            (
                "from_page_number".to_string(),
                self.from_page_number.to_string(),
            ),
            ("language".to_string(), self.language.clone()),
        ]);
        pairs
    }
}

/// One page of raw reviews. Items stay untyped so a single malformed review
/// can be rejected without losing the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatingsPage {
    pub items: Vec<JsonValue>,
    pub total: Option<u64>,
    pub response_code: i64,
    pub message: String,
}

impl RatingsPage {
    /// `comment_id` of the last item, which is the cursor for the next page.
    pub fn last_comment_id(&self) -> Option<i64> {
        self.items
            .last()
            .and_then(|item| item.get("comment_id"))
            .and_then(super::id_i64)
    }

    /// Every `comment_id` on the page, in page order.
    pub fn comment_ids(&self) -> Vec<i64> {
        self.items
            .iter()
            .filter_map(|item| item.get("comment_id").and_then(super::id_i64))
            .collect()
    }
}

#[async_trait]
pub trait SellerApi: Send + Sync {
    /// Switch credentials to `connection_id`. Idempotent.
    async fn bind(&self, connection_id: i64) -> Result<(), ClientError>;

    /// Fetch one ratings page; binds to `query.connection_id` first.
    async fn fetch_ratings(&self, query: &RatingsQuery) -> Result<RatingsPage, ClientError>;

    /// Total number of ratings in the window, from a one-item first page.
    async fn probe_total(
        &self,
        connection_id: i64,
        window: (Option<i64>, Option<i64>),
        language: &str,
    ) -> Result<u64, ClientError> {
        let query = RatingsQuery::at(connection_id, window, &PageCursor::first(), 1, language);
        let page = self.fetch_ratings(&query).await?;
        Ok(page.total.unwrap_or(0))
    }
}

/// Pre-authenticated request material for one shop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerSession {
    /// Extra request headers (cookie, csrf token, ...)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Extra query parameters appended to every call
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl SellerSession {
    /// Reads a session file: either `{"headers": {..}, "query": {..}}` or a
    /// flat map of header names to values.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::auth_expired(format!("cannot read session {}: {e}", path.display()))
        })?;
        let value: JsonValue = serde_json::from_str(&raw).map_err(|e| {
            ClientError::auth_expired(format!("invalid session {}: {e}", path.display()))
        })?;

        if value.get("headers").is_some() || value.get("query").is_some() {
            return serde_json::from_value(value).map_err(|e| {
                ClientError::auth_expired(format!("invalid session {}: {e}", path.display()))
            });
        }

        let headers = value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            headers,
            query: BTreeMap::new(),
        })
    }

    fn header_map(&self) -> Result<HeaderMap, ClientError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::auth_expired(format!("bad header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::auth_expired(format!("bad header value: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// Loads the session of every shop that names a credentials handle.
/// Shops whose session cannot be read are logged and left unbound.
pub fn load_sessions(registry: &ShopRegistry) -> HashMap<i64, SellerSession> {
    let mut sessions = HashMap::new();
    for shop in registry.list_shops() {
        let Some(handle) = shop.credentials_handle.as_deref() else {
            continue;
        };
        match SellerSession::load(Path::new(handle)) {
            Ok(session) => {
                sessions.insert(shop.connection_id, session);
            }
            Err(e) => {
                warn!(shop = %shop.name, connection_id = shop.connection_id, error = %e, "Seller session not loaded");
            }
        }
    }
    sessions
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    list: Option<Vec<JsonValue>>,
    #[serde(default)]
    page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(default)]
    total: Option<u64>,
}

/// reqwest-backed [`SellerApi`] against the seller portal.
pub struct ShopeeClient {
    http: reqwest::Client,
    base_url: String,
    sessions: HashMap<i64, SellerSession>,
    bound: Mutex<Option<i64>>,
}

impl ShopeeClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        sessions: HashMap<i64, SellerSession>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::permanent(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            sessions,
            bound: Mutex::new(None),
        })
    }

    /// Connection the client is currently bound to.
    pub fn bound_connection(&self) -> Option<i64> {
        self.bound.lock().ok().and_then(|guard| *guard)
    }

    fn session(&self, connection_id: i64) -> Result<&SellerSession, ClientError> {
        self.sessions.get(&connection_id).ok_or_else(|| {
            ClientError::auth_expired(format!(
                "no seller session configured for connection {connection_id}"
            ))
        })
    }
}

#[async_trait]
impl SellerApi for ShopeeClient {
    async fn bind(&self, connection_id: i64) -> Result<(), ClientError> {
        self.session(connection_id)?;
        let mut bound = self
            .bound
            .lock()
            .map_err(|_| ClientError::permanent("seller session lock poisoned"))?;
        if *bound != Some(connection_id) {
            debug!(connection_id, "Binding seller client to shop");
            *bound = Some(connection_id);
        }
        Ok(())
    }

    async fn fetch_ratings(&self, query: &RatingsQuery) -> Result<RatingsPage, ClientError> {
        self.bind(query.connection_id).await?;
        let session = self.session(query.connection_id)?;

        let mut pairs: Vec<(String, String)> = session
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.extend(query.query_pairs());

        let endpoint = format!("{}/{}", self.base_url.trim_end_matches('/'), RATINGS_PATH);
        let url = reqwest::Url::parse_with_params(&endpoint, &pairs)
            .map_err(|e| ClientError::permanent(format!("invalid ratings url: {e}")))?;

        let resp = self
            .http
            .get(url)
            .headers(session.header_map()?)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::from_status(resp.status(), "ratings fetch"));
        }

        let envelope: Envelope = resp.json().await?;
        let message = envelope.message.unwrap_or_default();
        if envelope.code != 0 {
            return Err(ClientError::Remote {
                code: envelope.code,
                message,
            });
        }

        let data = envelope
            .data
            .ok_or_else(|| ClientError::permanent("ratings response has no data"))?;

        Ok(RatingsPage {
            items: data.list.unwrap_or_default(),
            total: data.page_info.and_then(|p| p.total),
            response_code: envelope.code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_size_is_clamped_to_api_maximum() {
        let q = RatingsQuery::at(1, (None, None), &PageCursor::first(), 500, "vi");
        assert_eq!(q.page_size, MAX_PAGE_SIZE);
        let q = RatingsQuery::at(1, (None, None), &PageCursor::first(), 0, "vi");
        assert_eq!(q.page_size, 1);
    }

    #[test]
    fn first_page_query_uses_zero_cursor() {
        let q = RatingsQuery::at(1, (Some(10), Some(20)), &PageCursor::first(), 50, "vi");
        let pairs = q.query_pairs();
        assert!(pairs.contains(&("cursor".to_string(), "0".to_string())));
        assert!(pairs.contains(&("page_number".to_string(), "1".to_string())));
        assert!(pairs.contains(&("from_page_number".to_string(), "1".to_string())));
        assert!(pairs.contains(&("time_start".to_string(), "10".to_string())));
    }

    #[test]
    fn last_comment_id_reads_string_or_number() {
        let page = RatingsPage {
            items: vec![json!({"comment_id": 1}), json!({"comment_id": "79118132818"})],
            ..RatingsPage::default()
        };
        assert_eq!(page.last_comment_id(), Some(79118132818));
        assert_eq!(page.comment_ids(), vec![1, 79118132818]);
    }

    #[test]
    fn flat_session_file_becomes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.json");
        std::fs::write(&path, r#"{"cookie": "SPC_EC=abc"}"#).unwrap();
        let session = SellerSession::load(&path).unwrap();
        assert_eq!(session.headers.get("cookie").map(String::as_str), Some("SPC_EC=abc"));
        assert!(session.query.is_empty());
    }
}
