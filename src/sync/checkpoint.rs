//! Advisory checkpoint file mirroring the page being crawled.
//!
//! The job row is the only state read on resume; this file exists for
//! operators tailing a run and is never read back.

use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckpointRecord<'a> {
    pub job_id: i64,
    pub shop: &'a str,
    pub connection_id: i64,
    pub page_number: u32,
    pub cursor: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
    tz: FixedOffset,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>, tz: FixedOffset) -> Self {
        Self {
            path: path.into(),
            tz,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the file with the current position. Failures are logged
    /// and otherwise ignored.
    pub async fn write(
        &self,
        job_id: i64,
        shop: &str,
        connection_id: i64,
        page_number: u32,
        cursor: i64,
    ) {
        let record = CheckpointRecord {
            job_id,
            shop,
            connection_id,
            page_number,
            cursor,
            updated_at: Utc::now().with_timezone(&self.tz).to_rfc3339(),
        };
        if let Err(e) = self.write_record(&record).await {
            warn!(path = %self.path.display(), error = %e, "Could not write checkpoint file");
        }
    }

    async fn write_record(&self, record: &CheckpointRecord<'_>) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec(record)?;
        tokio::fs::write(&self.path, body).await
    }
}
