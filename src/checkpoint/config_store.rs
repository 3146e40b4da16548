//! Exploration artifact persistence
//!
//! The `CollectionConfig` is everything a later run needs to skip the
//! LLM-driven phases: replayable nav steps, the learned detail-link and
//! pagination xpaths, and the jump widget for resume.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::actions::NavStep;
use crate::error::{SpiderError, SpiderResult};

/// Input + button xpath pair for direct page jumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpWidget {
    pub input: String,
    pub button: String,
}

/// The exploration artifact, seed for resumable and distributed runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default)]
    pub nav_steps: Vec<NavStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_detail_xpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_xpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_widget_xpath: Option<JumpWidget>,
    #[serde(default)]
    pub list_url: String,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl CollectionConfig {
    /// Whether a stored config belongs to the same task
    #[must_use]
    pub fn is_compatible(&self, list_url: &str, task_description: &str) -> bool {
        (self.list_url.is_empty() || self.list_url == list_url)
            && (self.task_description.is_empty() || self.task_description == task_description)
    }
}

/// Reads and writes `collection_config.json`
pub struct CollectionConfigStore {
    path: PathBuf,
}

impl CollectionConfigStore {
    pub async fn open(output_dir: &Path) -> SpiderResult<Self> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("create {output_dir:?}: {e}")))?;
        Ok(Self {
            path: output_dir.join("collection_config.json"),
        })
    }

    pub async fn save(&self, config: &mut CollectionConfig) -> SpiderResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        if config.created_at.is_empty() {
            config.created_at = now.clone();
        }
        config.updated_at = now;

        let payload = serde_json::to_vec_pretty(config)
            .map_err(|e| SpiderError::Checkpoint(format!("encode config: {e}")))?;
        let tmp_path = self
            .path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("write {tmp_path:?}: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("rename config: {e}")))?;
        info!("collection config saved to {:?}", self.path);
        Ok(())
    }

    pub async fn load(&self) -> Option<CollectionConfig> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("unreadable collection config, ignoring: {e}");
                None
            }
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_roundtrip_and_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CollectionConfigStore::open(dir.path()).await.expect("open");
        assert!(store.load().await.is_none());

        let mut config = CollectionConfig {
            common_detail_xpath: Some("//section//ul/li/a".into()),
            pagination_xpath: Some("//a[contains(text(), 'Next')]".into()),
            jump_widget_xpath: Some(JumpWidget {
                input: "//input[@class='page-input']".into(),
                button: "//button[@class='page-go']".into(),
            }),
            list_url: "https://example.com/list".into(),
            task_description: "collect".into(),
            ..CollectionConfig::default()
        };
        store.save(&mut config).await.expect("save");
        let created = config.created_at.clone();
        assert!(!created.is_empty());

        // A second save keeps created_at and bumps updated_at
        store.save(&mut config).await.expect("save again");
        assert_eq!(config.created_at, created);

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.common_detail_xpath.as_deref(), Some("//section//ul/li/a"));
        assert!(loaded.jump_widget_xpath.is_some());
        assert!(loaded.is_compatible("https://example.com/list", "collect"));
        assert!(!loaded.is_compatible("https://example.com/list", "other task"));
    }
}
