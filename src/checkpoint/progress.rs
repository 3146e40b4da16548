//! Collection progress persistence
//!
//! `progress.json` is rewritten after every harvested page through a
//! temp-file + rename sequence, so a crash at any point leaves either the
//! old snapshot or the new one, never a torn file. `urls.txt` is append-only;
//! earlier lines are never rewritten.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{SpiderError, SpiderResult};

/// Lifecycle state of a collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

/// Checkpointed collector state, one snapshot per page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub status: CollectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    /// Task identity, checked for compatibility on resume
    pub list_url: String,
    pub task_description: String,
    pub current_page_num: u32,
    pub collected_count: usize,
    /// Rate controller state, restored on resume
    pub backoff_level: u32,
    pub consecutive_success_pages: u32,
    pub last_updated: String,
}

impl CollectionProgress {
    #[must_use]
    pub fn new(list_url: &str, task_description: &str) -> Self {
        Self {
            status: CollectionStatus::Running,
            pause_reason: None,
            list_url: list_url.to_string(),
            task_description: task_description.to_string(),
            current_page_num: 1,
            collected_count: 0,
            backoff_level: 0,
            consecutive_success_pages: 0,
            last_updated: String::new(),
        }
    }

    /// Whether a stored progress belongs to the same task
    #[must_use]
    pub fn is_compatible(&self, list_url: &str, task_description: &str) -> bool {
        self.list_url == list_url && self.task_description == task_description
    }
}

/// Stores progress.json and urls.txt under one output directory
pub struct ProgressStore {
    progress_path: PathBuf,
    urls_path: PathBuf,
}

impl ProgressStore {
    pub async fn open(output_dir: &Path) -> SpiderResult<Self> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("create {output_dir:?}: {e}")))?;
        Ok(Self {
            progress_path: output_dir.join("progress.json"),
            urls_path: output_dir.join("urls.txt"),
        })
    }

    /// Atomically replace progress.json
    pub async fn save_progress(&self, progress: &mut CollectionProgress) -> SpiderResult<()> {
        progress.last_updated = chrono::Utc::now().to_rfc3339();
        let payload = serde_json::to_vec_pretty(progress)
            .map_err(|e| SpiderError::Checkpoint(format!("encode progress: {e}")))?;

        let tmp_path = self
            .progress_path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("write {tmp_path:?}: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.progress_path)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("rename progress: {e}")))?;
        Ok(())
    }

    /// Load the stored progress, or None when no checkpoint exists
    pub async fn load_progress(&self) -> Option<CollectionProgress> {
        let bytes = tokio::fs::read(&self.progress_path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(progress) => Some(progress),
            Err(e) => {
                warn!("unreadable progress file, ignoring: {e}");
                None
            }
        }
    }

    #[must_use]
    pub fn has_checkpoint(&self) -> bool {
        self.progress_path.exists()
    }

    /// Append URLs not already on file. One line per URL; the write of a
    /// line (newline included) is the atomic unit.
    pub async fn append_urls(&self, urls: &[String]) -> SpiderResult<usize> {
        if urls.is_empty() {
            return Ok(0);
        }
        let existing = self.load_collected_urls().await;
        let existing: HashSet<&str> = existing.iter().map(String::as_str).collect();

        let mut block = String::new();
        let mut appended = 0;
        let mut in_block: HashSet<&str> = HashSet::new();
        for url in urls {
            if existing.contains(url.as_str()) || !in_block.insert(url.as_str()) {
                continue;
            }
            block.push_str(url);
            block.push('\n');
            appended += 1;
        }
        if appended == 0 {
            return Ok(0);
        }

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.urls_path)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("open urls.txt: {e}")))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("append urls.txt: {e}")))?;
        file.flush()
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("flush urls.txt: {e}")))?;
        Ok(appended)
    }

    /// All URLs on file, in append order
    pub async fn load_collected_urls(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.urls_path).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove the checkpoint files (fresh-start runs)
    pub async fn clear(&self) -> SpiderResult<()> {
        for path in [&self.progress_path, &self.urls_path] {
            if path.exists() {
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| SpiderError::Checkpoint(format!("remove {path:?}: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProgressStore::open(dir.path()).await.expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn test_progress_roundtrip() {
        let (_dir, store) = store().await;
        assert!(!store.has_checkpoint());
        assert!(store.load_progress().await.is_none());

        let mut progress = CollectionProgress::new("https://example.com/list", "collect");
        progress.current_page_num = 7;
        progress.backoff_level = 2;
        store.save_progress(&mut progress).await.expect("save");

        let loaded = store.load_progress().await.expect("load");
        assert_eq!(loaded.current_page_num, 7);
        assert_eq!(loaded.backoff_level, 2);
        assert_eq!(loaded.status, CollectionStatus::Running);
        assert!(!loaded.last_updated.is_empty());
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let (dir, store) = store().await;
        let mut progress = CollectionProgress::new("https://example.com/list", "collect");
        store.save_progress(&mut progress).await.expect("save");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files remained: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_urls_append_only_dedup() {
        let (_dir, store) = store().await;
        let first = vec![
            "https://example.com/1".to_string(),
            "https://example.com/2".to_string(),
        ];
        assert_eq!(store.append_urls(&first).await.expect("append"), 2);

        // Re-appending one old URL plus one new writes only the new one
        let second = vec![
            "https://example.com/2".to_string(),
            "https://example.com/3".to_string(),
        ];
        assert_eq!(store.append_urls(&second).await.expect("append"), 1);

        let all = store.load_collected_urls().await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], "https://example.com/1");
        assert_eq!(all[2], "https://example.com/3");
    }

    #[tokio::test]
    async fn test_compatibility_check() {
        let progress = CollectionProgress::new("https://example.com/list", "collect tenders");
        assert!(progress.is_compatible("https://example.com/list", "collect tenders"));
        assert!(!progress.is_compatible("https://example.com/other", "collect tenders"));
        assert!(!progress.is_compatible("https://example.com/list", "different task"));
    }
}
