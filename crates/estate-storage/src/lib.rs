//! Fetch strategy chain, raw page archive and the versioned listing table.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod fetch;
pub mod table;

pub use fetch::{
    classify_status, BackoffPolicy, BrowserProfile, FetchContext, FetchError, FetchErrorKind,
    FetchResult, FetchStrategy, FetchedPage, HttpClientConfig, HttpStrategy, ProfileStrategy,
    RetryDisposition, StrategyChain,
};
pub use table::{CommitEntry, CommitMetrics, SegmentRef, TableError, TableSnapshot, TableStore, TableWriter};

pub const CRATE_NAME: &str = "estate-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers
/// observe either the previous content or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw fetched pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.html"))
    }

    /// Store a page body once per content hash; repeated bodies are reported as deduplicated.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = sha256_hex(body);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archived page {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, body)
                .await
                .with_context(|| format!("archiving page {}", absolute_path.display()))?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: body.len(),
            deduplicated: exists,
        })
    }
}
