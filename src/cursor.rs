//! # Page Cursor
//!
//! Position of a shop crawl on the seller ratings endpoint, and recovery of
//! positions from debug URLs and job log lines.
//!
//! The seller API pages with a cursor: page N+1 is requested with
//! `cursor = comment_id of the last item of page N`, `page_number = N+1`,
//! `from_page_number = N`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static DEBUG_PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"page_number=(\d+)").expect("valid page_number regex"));
static DEBUG_CURSOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cursor=(\d+)").expect("valid cursor regex"));
static PROGRESS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Page\s+(\d+)\s*\|\s*Cursor\s+(\d+)").expect("valid progress line regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorParseError {
    #[error("no page_number=<n> found in '{input}'")]
    MissingPage { input: String },
    #[error("no cursor=<n> found in '{input}'")]
    MissingCursor { input: String },
    #[error("value '{value}' is out of range")]
    OutOfRange { value: String },
}

/// Next request position for one shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page_number: u32,
    pub cursor: i64,
    pub from_page_number: u32,
}

impl PageCursor {
    pub fn first() -> Self {
        Self {
            page_number: 1,
            cursor: 0,
            from_page_number: 1,
        }
    }

    /// Position restored from a job checkpoint.
    pub fn resume_at(page_number: u32, cursor: Option<i64>) -> Self {
        let page_number = page_number.max(1);
        Self {
            page_number,
            cursor: cursor.unwrap_or(0),
            from_page_number: page_number.saturating_sub(1).max(1),
        }
    }

    /// Move past a fetched page whose last item was `last_comment_id`.
    pub fn advance(&mut self, last_comment_id: Option<i64>) {
        self.from_page_number = self.page_number;
        self.page_number += 1;
        if let Some(id) = last_comment_id {
            self.cursor = id;
        }
    }

    /// Move past a page that could not be fetched; the cursor is kept.
    pub fn skip(&mut self) {
        self.from_page_number = self.page_number;
        self.page_number += 1;
    }

    /// Cursor as persisted on the job (`None` before the first page).
    pub fn stored_cursor(&self) -> Option<i64> {
        (self.cursor != 0).then_some(self.cursor)
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::first()
    }
}

/// Largest logged page whose continuation still fits the job's page column.
pub const MAX_LOGGED_PAGE: u32 = i32::MAX as u32 - 1;

/// A `(page, cursor)` pair recovered from a debug URL or a progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedPosition {
    pub page_number: u32,
    pub cursor: i64,
}

impl LoggedPosition {
    /// Where to continue: the next page, with the logged cursor.
    pub fn continuation(&self) -> PageCursor {
        PageCursor::resume_at(self.page_number.saturating_add(1), Some(self.cursor))
    }
}

/// Parse `...page_number=N...cursor=C...` (a request URL or query string).
pub fn parse_debug_log(input: &str) -> Result<LoggedPosition, CursorParseError> {
    let page = DEBUG_PAGE_RE
        .captures(input)
        .and_then(|c| c.get(1))
        .ok_or_else(|| CursorParseError::MissingPage {
            input: input.to_string(),
        })?;
    let cursor = DEBUG_CURSOR_RE
        .captures(input)
        .and_then(|c| c.get(1))
        .ok_or_else(|| CursorParseError::MissingCursor {
            input: input.to_string(),
        })?;

    let page_number: u32 = parse_number(page.as_str())?;
    if page_number > MAX_LOGGED_PAGE {
        return Err(CursorParseError::OutOfRange {
            value: page.as_str().to_string(),
        });
    }
    Ok(LoggedPosition {
        page_number,
        cursor: parse_number(cursor.as_str())?,
    })
}

/// Parse a job progress line of the form `... Page N | Cursor C ...`.
pub fn parse_progress_line(line: &str) -> Option<LoggedPosition> {
    let caps = PROGRESS_LINE_RE.captures(line)?;
    Some(LoggedPosition {
        page_number: caps
            .get(1)?
            .as_str()
            .parse()
            .ok()
            .filter(|page| *page <= MAX_LOGGED_PAGE)?,
        cursor: caps.get(2)?.as_str().parse().ok()?,
    })
}

/// Progress line understood by [`parse_progress_line`], written once page
/// `fetched_page` is in hand. The cursor is the one that continues after it.
pub fn progress_line(shop: &str, fetched_page: u32, next_cursor: i64, items: usize) -> String {
    format!("{shop}: Page {fetched_page} | Cursor {next_cursor} | {items} reviews")
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T, CursorParseError> {
    raw.parse().map_err(|_| CursorParseError::OutOfRange {
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_cursor_to_last_item() {
        let mut pos = PageCursor::first();
        pos.advance(Some(500));
        assert_eq!(
            pos,
            PageCursor {
                page_number: 2,
                cursor: 500,
                from_page_number: 1
            }
        );
        pos.skip();
        assert_eq!(pos.page_number, 3);
        assert_eq!(pos.from_page_number, 2);
        assert_eq!(pos.cursor, 500);
    }

    #[test]
    fn debug_log_continues_on_next_page_with_same_cursor() {
        let logged = parse_debug_log("page_number=2&cursor=79118132818").unwrap();
        assert_eq!(logged.page_number, 2);
        assert_eq!(logged.cursor, 79118132818);

        let next = logged.continuation();
        assert_eq!(next.page_number, 3);
        assert_eq!(next.cursor, 79118132818);
        assert_eq!(next.from_page_number, 2);
    }

    #[test]
    fn oversized_logged_page_is_rejected() {
        assert_eq!(
            parse_debug_log("page_number=4294967295&cursor=1"),
            Err(CursorParseError::OutOfRange {
                value: "4294967295".to_string()
            })
        );
        assert!(matches!(
            parse_debug_log("page_number=99999999999&cursor=1"),
            Err(CursorParseError::OutOfRange { .. })
        ));
        assert!(parse_progress_line("alpha: Page 4294967295 | Cursor 9 | 50 reviews").is_none());

        let last = parse_debug_log(&format!("page_number={MAX_LOGGED_PAGE}&cursor=1")).unwrap();
        assert_eq!(last.continuation().page_number, i32::MAX as u32);
    }

    #[test]
    fn debug_log_inside_full_url() {
        let url = "https://banhang.shopee.vn/api/v3/settings/search_shop_rating_comments_new/?rating_star=5&page_number=7&page_size=50&cursor=123&from_page_number=6";
        let logged = parse_debug_log(url).unwrap();
        assert_eq!(logged.page_number, 7);
        assert_eq!(logged.cursor, 123);
    }

    #[test]
    fn debug_log_without_cursor_is_rejected() {
        assert_eq!(
            parse_debug_log("page_number=2"),
            Err(CursorParseError::MissingCursor {
                input: "page_number=2".to_string()
            })
        );
        assert!(matches!(
            parse_debug_log("cursor=2"),
            Err(CursorParseError::MissingPage { .. })
        ));
    }

    #[test]
    fn progress_line_round_trips() {
        let line = format!("[10:00:00] {}", progress_line("alpha", 4, 88, 50));
        assert_eq!(
            parse_progress_line(&line),
            Some(LoggedPosition {
                page_number: 4,
                cursor: 88
            })
        );
        assert_eq!(parse_progress_line("alpha: done"), None);
    }

    #[test]
    fn resume_at_clamps_page_and_defaults_cursor() {
        let pos = PageCursor::resume_at(0, None);
        assert_eq!(pos, PageCursor::first());
        assert_eq!(pos.stored_cursor(), None);
    }
}
