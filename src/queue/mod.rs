//! Reliable work queue
//!
//! At-least-once delivery with in-place dedup and consumer failover. Two key
//! spaces: a data map keyed by the content hash of the URL (set-if-absent
//! writes make `push` idempotent) and an append-only stream consumed through
//! a consumer group whose pending list drives retry and failover.
//!
//! The backing store only needs (a) a map with set-if-absent and (b) an
//! append-only stream with consumer groups. [`memory::MemoryWorkQueue`] is
//! the single-process implementation; a networked store slots in behind
//! [`WorkQueue`].

pub mod memory;

pub use memory::MemoryWorkQueue;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SpiderResult;

/// Stable content-addressed id: first 16 hex chars of sha256(url).
///
/// The same URL always hashes to the same id, so a second push of the same
/// URL is a no-op against the data map.
#[must_use]
pub fn item_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Retry bookkeeping carried inside each work item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemMeta {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_retries: Option<u32>,
}

/// A URL in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub url: String,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: WorkItemMeta,
}

impl WorkItem {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            created_at: chrono::Utc::now().timestamp(),
            metadata: WorkItemMeta::default(),
        }
    }
}

/// One delivered message: stream position, data id, and the payload
#[derive(Debug, Clone)]
pub struct FetchedTask {
    pub stream_id: String,
    pub data_id: String,
    pub item: WorkItem,
}

/// Entry on the dead-letter stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub data_id: String,
    pub url: String,
    pub error: String,
    pub retries: u32,
    pub failed_at: i64,
}

/// Queue statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_items: usize,
    pub stream_length: usize,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    /// Pending message count per consumer
    pub consumers: HashMap<String, usize>,
}

/// The queue contract shared by the collector and the extractor workers
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Push one URL. Returns whether the item was new (dedup hit → false).
    async fn push(&self, url: &str, metadata: Option<WorkItemMeta>) -> SpiderResult<bool>;

    /// Pipelined push of many URLs; returns how many were new. When a
    /// metadata list is given it is matched to the URLs by position;
    /// missing tail entries get default metadata.
    async fn push_batch(
        &self,
        urls: &[String],
        metadata_list: Option<&[WorkItemMeta]>,
    ) -> SpiderResult<usize>;

    /// Read up to `count` new messages for `consumer`, blocking up to
    /// `block_ms` when the stream is drained
    async fn fetch(
        &self,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> SpiderResult<Vec<FetchedTask>>;

    /// Remove a delivered message from the pending list
    async fn ack(&self, stream_id: &str) -> SpiderResult<bool>;

    /// Record a failure. Under the retry budget the message stays pending for
    /// another consumer to reclaim; over it the message is acked and
    /// dead-lettered.
    async fn fail(
        &self,
        stream_id: &str,
        data_id: &str,
        error: &str,
        max_retries: u32,
    ) -> SpiderResult<bool>;

    /// Claim messages idle longer than `max_idle_ms` from other consumers
    async fn recover_stale(
        &self,
        consumer: &str,
        max_idle_ms: u64,
        count: usize,
    ) -> SpiderResult<Vec<FetchedTask>>;

    /// Look up one URL's data entry
    async fn get_item(&self, url: &str) -> SpiderResult<Option<WorkItem>>;

    /// Every data entry, for resume-time merging with urls.txt
    async fn all_items(&self) -> SpiderResult<Vec<WorkItem>>;

    /// Dead-letter entries, for reporting
    async fn dead_letters(&self) -> SpiderResult<Vec<DeadLetter>>;

    async fn stats(&self) -> SpiderResult<QueueStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_hash_stable_and_short() {
        let a = item_hash("https://example.com/detail/1");
        let b = item_hash("https://example.com/detail/1");
        let c = item_hash("https://example.com/detail/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
