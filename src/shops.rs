//! Shop registry
//!
//! Read-only list of configured seller shops, in file order. The order is
//! the crawl order and must stay stable across runs for resume to be
//! deterministic.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::clients::id_i64;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Shop '{key}' not found")]
    ShopNotFound { key: String },
    #[error("failed to load shop registry {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// One configured seller account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub name: String,
    pub connection_id: i64,
    /// Path of the session file holding the shop's request headers
    #[serde(default)]
    pub credentials_handle: Option<String>,
    #[serde(default)]
    pub seller_shop_id: Option<i64>,
}

/// Either a connection id or a shop name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShopKey {
    ConnectionId(i64),
    Name(String),
}

impl From<&str> for ShopKey {
    fn from(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => ShopKey::ConnectionId(id),
            Err(_) => ShopKey::Name(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for ShopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShopKey::ConnectionId(id) => write!(f, "{id}"),
            ShopKey::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    shops: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ShopRegistry {
    shops: Vec<Shop>,
}

impl ShopRegistry {
    /// Registry over `shops`; later duplicates of a connection id are dropped.
    pub fn new(shops: Vec<Shop>) -> Self {
        let mut seen = HashSet::new();
        let shops = shops
            .into_iter()
            .filter(|shop| {
                let fresh = seen.insert(shop.connection_id);
                if !fresh {
                    warn!(shop = %shop.name, connection_id = shop.connection_id, "Duplicate shop connection ignored");
                }
                fresh
            })
            .collect();
        Self { shops }
    }

    /// Loads `{"shops": [{name, connection_id, credentials_handle?, seller_shop_id?}]}`.
    ///
    /// `shop_connect`, `headers_file` and `shop_id` are accepted as aliases.
    /// Entries without a usable connection id are skipped.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        let load_err = |message: String| RegistryError::Load {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let file: RegistryFile = serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut shops = Vec::with_capacity(file.shops.len());
        for (position, entry) in file.shops.iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("shop-{position}"));

            let Some(connection_id) = ["connection_id", "shop_connect"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(id_i64))
            else {
                warn!(shop = %name, "Shop has no connection id; skipped");
                continue;
            };

            let credentials_handle = ["credentials_handle", "headers_file"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(JsonValue::as_str))
                .map(|handle| resolve_relative(base_dir, handle));

            let seller_shop_id = ["seller_shop_id", "shop_id"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(id_i64));

            shops.push(Shop {
                name,
                connection_id,
                credentials_handle,
                seller_shop_id,
            });
        }

        Ok(Self::new(shops))
    }

    pub fn list_shops(&self) -> &[Shop] {
        &self.shops
    }

    pub fn len(&self) -> usize {
        self.shops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shops.is_empty()
    }

    /// Numeric keys match connection ids first, then names.
    pub fn resolve(&self, key: &ShopKey) -> Result<&Shop, RegistryError> {
        let found = match key {
            ShopKey::ConnectionId(id) => self
                .shops
                .iter()
                .find(|s| s.connection_id == *id)
                .or_else(|| {
                    let name = id.to_string();
                    self.shops.iter().find(|s| s.name == name)
                }),
            ShopKey::Name(name) => self.shops.iter().find(|s| &s.name == name),
        };
        found.ok_or_else(|| RegistryError::ShopNotFound {
            key: key.to_string(),
        })
    }

    /// Index of the shop with `connection_id` in crawl order.
    pub fn position(&self, connection_id: i64) -> Option<usize> {
        self.shops
            .iter()
            .position(|s| s.connection_id == connection_id)
    }
}

fn resolve_relative(base_dir: &Path, handle: &str) -> String {
    let path = Path::new(handle);
    if path.is_absolute() {
        handle.to_string()
    } else {
        base_dir.join(path).to_string_lossy().into_owned()
    }
}
