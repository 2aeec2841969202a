//! Media URL and CDN id normalisation.

use serde_json::Value;

/// Seller CDN prefix for bare file ids.
pub const CDN_FILE_PREFIX: &str = "https://cf.shopee.vn/file/";

const KNOWN_CDN_PREFIXES: &[&str] = &[
    "https://cf.shopee.vn/file/",
    "http://cf.shopee.vn/file/",
    "https://down-vn.img.susercontent.com/file/",
    "https://s-cf-vn.shopeesz.com/file/",
];

/// Normalise review media to a flat list of URLs.
///
/// Accepts a list of URLs/ids or `{images: [...], videos: [...]}`. Entries
/// that are full URLs or paths are kept, bare ids get [`CDN_FILE_PREFIX`].
/// Applying it to its own output changes nothing.
pub fn normalize_media(raw: &Value) -> Vec<String> {
    let mut out = Vec::new();
    match raw {
        Value::Array(items) => collect_entries(items, &mut out),
        Value::Object(map) => {
            for key in ["images", "videos"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    collect_entries(items, &mut out);
                }
            }
        }
        Value::String(s) => push_entry(s, &mut out),
        _ => {}
    }
    out
}

fn collect_entries(items: &[Value], out: &mut Vec<String>) {
    for item in items {
        match item {
            Value::String(s) => push_entry(s, out),
            // video entries come as objects carrying a url
            Value::Object(map) => {
                if let Some(url) = ["url", "video_url", "cover"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                {
                    push_entry(url, out);
                }
            }
            _ => {}
        }
    }
}

fn push_entry(entry: &str, out: &mut Vec<String>) {
    let entry = entry.trim();
    if entry.is_empty() {
        return;
    }
    if entry.starts_with("http://") || entry.starts_with("https://") || entry.contains('/') {
        out.push(entry.to_string());
    } else {
        out.push(format!("{CDN_FILE_PREFIX}{entry}"));
    }
}

/// Bare CDN id of a portrait or cover: strips a known CDN prefix, else
/// keeps the last path segment. Query strings are dropped.
pub fn bare_cdn_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.split(['?', '#']).next().unwrap_or(raw);
    let id = KNOWN_CDN_PREFIXES
        .iter()
        .find_map(|prefix| raw.strip_prefix(prefix))
        .unwrap_or_else(|| raw.rsplit('/').next().unwrap_or(raw));
    let id = id.trim_matches('/');
    (!id.is_empty()).then(|| id.to_string())
}

/// Product image URL for a cover that may be an id or already a URL.
pub fn product_image_url(cover: &str) -> Option<String> {
    let cover = cover.trim();
    if cover.is_empty() {
        None
    } else if cover.starts_with("http://") || cover.starts_with("https://") {
        Some(cover.to_string())
    } else {
        bare_cdn_id(cover).map(|id| format!("{CDN_FILE_PREFIX}{id}"))
    }
}
