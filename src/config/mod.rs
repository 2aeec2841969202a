//! Configuration loading for the feedback sync pipeline.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `FEEDBACK_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "FEEDBACK_SYNC_";

/// Application configuration derived from `FEEDBACK_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// JSON file listing the configured shops
    #[serde(default = "default_shops_file")]
    pub shops_file: PathBuf,
    #[serde(default = "default_seller_api_base")]
    pub seller_api_base: String,
    #[serde(default = "default_seller_request_timeout_secs")]
    pub seller_request_timeout_secs: u64,
    #[serde(default = "default_seller_language")]
    pub seller_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erp_api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erp_access_token: Option<String>,
    /// Fleet-wide shop timezone as hours east of UTC
    #[serde(default = "default_shop_utc_offset_hours")]
    pub shop_utc_offset_hours: i32,
    /// Advisory checkpoint mirror; `None` disables it
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Tuning knobs for the crawl loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Attempts per seller page before the page is skipped (default: 5)
    #[serde(default = "default_page_retry_attempts")]
    pub page_retry_attempts: u32,

    /// Fixed delay between page attempts in milliseconds (default: 3000)
    #[serde(default = "default_page_retry_backoff_ms")]
    pub page_retry_backoff_ms: u64,

    /// Gap between consecutive page fetches in milliseconds (default: 100)
    #[serde(default = "default_inter_page_delay_ms")]
    pub inter_page_delay_ms: u64,

    /// Items per round-robin shop batch in full mode (default: 1000)
    #[serde(default = "default_full_batch_items")]
    pub full_batch_items: u64,

    /// Batches per shop per incremental run (default: 100)
    #[serde(default = "default_incremental_max_batches")]
    pub incremental_max_batches: u32,

    /// Overlap subtracted from the newest stored review time (default: 3600)
    #[serde(default = "default_incremental_overlap_secs")]
    pub incremental_overlap_secs: i64,

    /// Look-back used when the store is empty (default: 7)
    #[serde(default = "default_incremental_default_lookback_days")]
    pub incremental_default_lookback_days: i64,

    /// Skipped pages in a row before a shop is abandoned (default: 3)
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_retry_attempts: default_page_retry_attempts(),
            page_retry_backoff_ms: default_page_retry_backoff_ms(),
            inter_page_delay_ms: default_inter_page_delay_ms(),
            full_batch_items: default_full_batch_items(),
            incremental_max_batches: default_incremental_max_batches(),
            incremental_overlap_secs: default_incremental_overlap_secs(),
            incremental_default_lookback_days: default_incremental_default_lookback_days(),
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
        }
    }
}

impl SyncConfig {
    /// Validate crawl configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_retry_attempts == 0 || self.page_retry_attempts > 20 {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.page_retry_attempts,
            });
        }

        if self.full_batch_items == 0 {
            return Err(ConfigError::InvalidBatchItems {
                value: self.full_batch_items,
            });
        }

        if self.incremental_max_batches == 0 {
            return Err(ConfigError::InvalidIncrementalBatches {
                value: self.incremental_max_batches,
            });
        }

        if self.max_consecutive_page_failures == 0 {
            return Err(ConfigError::InvalidConsecutiveFailures {
                value: self.max_consecutive_page_failures,
            });
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            shops_file: default_shops_file(),
            seller_api_base: default_seller_api_base(),
            seller_request_timeout_secs: default_seller_request_timeout_secs(),
            seller_language: default_seller_language(),
            erp_api_base: None,
            erp_access_token: None,
            shop_utc_offset_hours: default_shop_utc_offset_hours(),
            checkpoint_path: default_checkpoint_path(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Shop-local timezone used for time windows and log timestamps.
    pub fn shop_timezone(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.shop_utc_offset_hours * 3600).ok_or(
            ConfigError::InvalidShopUtcOffset {
                value: self.shop_utc_offset_hours,
            },
        )
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.erp_access_token.is_some() {
            config.erp_access_token = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if a setting is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-12..=14).contains(&self.shop_utc_offset_hours) {
            return Err(ConfigError::InvalidShopUtcOffset {
                value: self.shop_utc_offset_hours,
            });
        }

        if self.seller_request_timeout_secs == 0 {
            return Err(ConfigError::InvalidSellerTimeout {
                value: self.seller_request_timeout_secs,
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        validate_base_url("SELLER_API_BASE", &self.seller_api_base)?;
        if let Some(base) = &self.erp_api_base {
            validate_base_url("ERP_API_BASE", base)?;
        }

        self.sync.validate()?;

        Ok(())
    }
}

fn validate_base_url(key: &str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidBaseUrl {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        }),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://feedback_sync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_shops_file() -> PathBuf {
    PathBuf::from("config/shops.json")
}

fn default_seller_api_base() -> String {
    "https://banhang.shopee.vn/api/v3".to_string()
}

fn default_seller_request_timeout_secs() -> u64 {
    30
}

fn default_seller_language() -> String {
    "vi".to_string()
}

fn default_shop_utc_offset_hours() -> i32 {
    7 // Asia/Ho_Chi_Minh, no DST
}

fn default_checkpoint_path() -> Option<PathBuf> {
    Some(PathBuf::from("logs/log_feedback.log"))
}

fn default_page_retry_attempts() -> u32 {
    5
}

fn default_page_retry_backoff_ms() -> u64 {
    3000
}

fn default_inter_page_delay_ms() -> u64 {
    100
}

fn default_full_batch_items() -> u64 {
    1000
}

fn default_incremental_max_batches() -> u32 {
    100
}

fn default_incremental_overlap_secs() -> i64 {
    3600 // 1 hour
}

fn default_incremental_default_lookback_days() -> i64 {
    7
}

fn default_max_consecutive_page_failures() -> u32 {
    3
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("{key} must be an absolute http(s) URL, got '{value}'")]
    InvalidBaseUrl { key: String, value: String },
    #[error("shop UTC offset must be between -12 and 14 hours, got {value}")]
    InvalidShopUtcOffset { value: i32 },
    #[error("seller request timeout must be positive, got {value}")]
    InvalidSellerTimeout { value: u64 },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("page retry attempts must be between 1 and 20, got {value}")]
    InvalidRetryAttempts { value: u32 },
    #[error("full sync batch size must be positive, got {value}")]
    InvalidBatchItems { value: u64 },
    #[error("incremental batch limit must be positive, got {value}")]
    InvalidIncrementalBatches { value: u32 },
    #[error("consecutive page failure limit must be positive, got {value}")]
    InvalidConsecutiveFailures { value: u32 },
}

/// Loads configuration using layered `.env` files and `FEEDBACK_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration from the layered env files, then the process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let defaults = SyncConfig::default();

        let sync = SyncConfig {
            page_retry_attempts: take_parsed(&mut layered, "PAGE_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.page_retry_attempts),
            page_retry_backoff_ms: take_parsed(&mut layered, "PAGE_RETRY_BACKOFF_MS")?
                .unwrap_or(defaults.page_retry_backoff_ms),
            inter_page_delay_ms: take_parsed(&mut layered, "INTER_PAGE_DELAY_MS")?
                .unwrap_or(defaults.inter_page_delay_ms),
            full_batch_items: take_parsed(&mut layered, "FULL_BATCH_ITEMS")?
                .unwrap_or(defaults.full_batch_items),
            incremental_max_batches: take_parsed(&mut layered, "INCREMENTAL_MAX_BATCHES")?
                .unwrap_or(defaults.incremental_max_batches),
            incremental_overlap_secs: take_parsed(&mut layered, "INCREMENTAL_OVERLAP_SECS")?
                .unwrap_or(defaults.incremental_overlap_secs),
            incremental_default_lookback_days: take_parsed(
                &mut layered,
                "INCREMENTAL_DEFAULT_LOOKBACK_DAYS",
            )?
            .unwrap_or(defaults.incremental_default_lookback_days),
            max_consecutive_page_failures: take_parsed(
                &mut layered,
                "MAX_CONSECUTIVE_PAGE_FAILURES",
            )?
            .unwrap_or(defaults.max_consecutive_page_failures),
        };

        // An explicitly empty checkpoint path disables the mirror file.
        let checkpoint_path = match layered.remove("CHECKPOINT_PATH") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(PathBuf::from(value)),
            None => default_checkpoint_path(),
        };

        let config = AppConfig {
            profile,
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            shops_file: take_string(&mut layered, "SHOPS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_shops_file),
            seller_api_base: take_string(&mut layered, "SELLER_API_BASE")
                .unwrap_or_else(default_seller_api_base),
            seller_request_timeout_secs: take_parsed(&mut layered, "SELLER_REQUEST_TIMEOUT_SECS")?
                .unwrap_or_else(default_seller_request_timeout_secs),
            seller_language: take_string(&mut layered, "SELLER_LANGUAGE")
                .unwrap_or_else(default_seller_language),
            erp_api_base: take_string(&mut layered, "ERP_API_BASE"),
            erp_access_token: take_string(&mut layered, "ERP_ACCESS_TOKEN"),
            shop_utc_offset_hours: take_parsed(&mut layered, "SHOP_UTC_OFFSET_HOURS")?
                .unwrap_or_else(default_shop_utc_offset_hours),
            checkpoint_path,
            sync,
        };

        config.validate()?;

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
        None => Ok(None),
    }
}
