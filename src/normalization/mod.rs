//! Normalisation of raw seller-portal review fields into stored form.

pub mod literal;
pub mod media;
pub mod reply;

pub use media::{CDN_FILE_PREFIX, bare_cdn_id, normalize_media, product_image_url};
pub use reply::{ReplyInfo, extract_reply};

/// Storage bounds of truncated text columns, in characters.
pub const MAX_PRODUCT_NAME: usize = 1000;
pub const MAX_BUYER_NAME: usize = 200;
pub const MAX_PORTRAIT: usize = 200;
pub const MAX_PRODUCT_COVER: usize = 200;
pub const MAX_ORDER_REF: usize = 100;

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
