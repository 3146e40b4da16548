//! Single-process work queue
//!
//! Faithful to the stream/consumer-group model: an append-only stream of
//! `{data_id}` entries, one consumer group with a read cursor, and a pending
//! list keyed by stream id. Delivery is at-least-once; a crashed consumer's
//! messages sit on the pending list until another consumer's
//! `recover_stale` claims them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{Mutex, Notify};

use crate::error::{SpiderError, SpiderResult};

use super::{
    item_hash, DeadLetter, FetchedTask, QueueStats, WorkItem, WorkItemMeta, WorkQueue,
};

#[derive(Debug, Clone)]
struct StreamEntry {
    stream_id: String,
    data_id: String,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    data_id: String,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    /// {prefix}:data — item_hash → payload, set-if-absent
    data: HashMap<String, WorkItem>,
    /// {prefix}:stream — append-only log
    stream: Vec<StreamEntry>,
    /// {prefix}:workers — the single consumer group's read cursor
    cursor: usize,
    /// Pending entries list: stream_id → delivery state
    pending: HashMap<String, PendingEntry>,
    /// {prefix}:dead_letter
    dead_letter: Vec<DeadLetter>,
    next_seq: u64,
}

/// In-memory queue with stream semantics
pub struct MemoryWorkQueue {
    key_prefix: String,
    state: Mutex<QueueState>,
    /// Wakes blocked fetchers when the stream grows
    appended: Arc<Notify>,
}

impl MemoryWorkQueue {
    #[must_use]
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            state: Mutex::new(QueueState::default()),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Namespace prefix, mirrored from the config for observability
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn push_locked(state: &mut QueueState, url: &str, metadata: Option<WorkItemMeta>) -> bool {
        let data_id = item_hash(url);
        if state.data.contains_key(&data_id) {
            debug!("dedup hit for {url}");
            return false;
        }
        let mut item = WorkItem::new(url);
        if let Some(meta) = metadata {
            item.metadata = meta;
        }
        state.data.insert(data_id.clone(), item);

        state.next_seq += 1;
        let stream_id = format!("{}-0", state.next_seq);
        state.stream.push(StreamEntry { stream_id, data_id });
        true
    }

    fn read_new_locked(
        state: &mut QueueState,
        consumer: &str,
        count: usize,
    ) -> Vec<FetchedTask> {
        let mut out = Vec::new();
        while out.len() < count && state.cursor < state.stream.len() {
            let entry = state.stream[state.cursor].clone();
            state.cursor += 1;
            let Some(item) = state.data.get(&entry.data_id).cloned() else {
                continue;
            };
            state.pending.insert(
                entry.stream_id.clone(),
                PendingEntry {
                    data_id: entry.data_id.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            out.push(FetchedTask {
                stream_id: entry.stream_id,
                data_id: entry.data_id,
                item,
            });
        }
        out
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, url: &str, metadata: Option<WorkItemMeta>) -> SpiderResult<bool> {
        let inserted = {
            let mut state = self.state.lock().await;
            Self::push_locked(&mut state, url, metadata)
        };
        if inserted {
            self.appended.notify_waiters();
        }
        Ok(inserted)
    }

    async fn push_batch(
        &self,
        urls: &[String],
        metadata_list: Option<&[WorkItemMeta]>,
    ) -> SpiderResult<usize> {
        if urls.is_empty() {
            return Ok(0);
        }
        let inserted = {
            let mut state = self.state.lock().await;
            urls.iter()
                .enumerate()
                .filter(|(index, url)| {
                    let metadata =
                        metadata_list.and_then(|list| list.get(*index)).cloned();
                    Self::push_locked(&mut state, url, metadata)
                })
                .count()
        };
        if inserted > 0 {
            self.appended.notify_waiters();
        }
        Ok(inserted)
    }

    async fn fetch(
        &self,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> SpiderResult<Vec<FetchedTask>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            // Register interest before checking so an append between the
            // check and the wait still wakes us.
            let notified = self.appended.notified();
            {
                let mut state = self.state.lock().await;
                let tasks = Self::read_new_locked(&mut state, consumer, count);
                if !tasks.is_empty() {
                    debug!("[{consumer}] fetched {} task(s)", tasks.len());
                    return Ok(tasks);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream_id: &str) -> SpiderResult<bool> {
        let mut state = self.state.lock().await;
        let removed = state.pending.remove(stream_id).is_some();
        if removed {
            debug!("acked {stream_id}");
        }
        Ok(removed)
    }

    async fn fail(
        &self,
        stream_id: &str,
        data_id: &str,
        error: &str,
        max_retries: u32,
    ) -> SpiderResult<bool> {
        let mut state = self.state.lock().await;

        let retry_count = state
            .data
            .get(data_id)
            .map(|item| item.metadata.retry_count)
            .ok_or_else(|| SpiderError::Queue(format!("no data entry for {data_id}")))?;

        let now = chrono::Utc::now().timestamp();
        if retry_count < max_retries {
            let item = state
                .data
                .get_mut(data_id)
                .ok_or_else(|| SpiderError::Queue(format!("no data entry for {data_id}")))?;
            item.metadata.retry_count = retry_count + 1;
            item.metadata.last_error = Some(error.to_string());
            item.metadata.last_failed_at = Some(now);
            warn!(
                "task failed, will retry ({}/{max_retries}): {} — {error}",
                retry_count + 1,
                item.url
            );
            // No ack: the message stays on the pending list so another
            // consumer can reclaim it once it goes idle.
            return Ok(true);
        }

        // Retry budget exhausted: ack and dead-letter
        state.pending.remove(stream_id);
        let url = {
            let item = state
                .data
                .get_mut(data_id)
                .ok_or_else(|| SpiderError::Queue(format!("no data entry for {data_id}")))?;
            item.metadata.final_error = Some(error.to_string());
            item.metadata.final_failed_at = Some(now);
            item.metadata.total_retries = Some(retry_count);
            item.url.clone()
        };
        warn!("task permanently failed after {retry_count} retries: {url} — {error}");
        state.dead_letter.push(DeadLetter {
            data_id: data_id.to_string(),
            url,
            error: error.to_string(),
            retries: retry_count,
            failed_at: now,
        });
        Ok(true)
    }

    async fn recover_stale(
        &self,
        consumer: &str,
        max_idle_ms: u64,
        count: usize,
    ) -> SpiderResult<Vec<FetchedTask>> {
        let max_idle = Duration::from_millis(max_idle_ms);
        let mut state = self.state.lock().await;

        let stale_ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.delivered_at.elapsed() >= max_idle)
            .take(count)
            .map(|(stream_id, _)| stream_id.clone())
            .collect();

        let mut claimed = Vec::new();
        for stream_id in stale_ids {
            let Some(entry) = state.pending.get(&stream_id).cloned() else {
                continue;
            };
            let Some(item) = state.data.get(&entry.data_id).cloned() else {
                state.pending.remove(&stream_id);
                continue;
            };
            state.pending.insert(
                stream_id.clone(),
                PendingEntry {
                    data_id: entry.data_id.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: entry.delivery_count + 1,
                },
            );
            claimed.push(FetchedTask {
                stream_id,
                data_id: entry.data_id,
                item,
            });
        }

        if !claimed.is_empty() {
            warn!(
                "[{consumer}] reclaimed {} stale task(s) (idle > {}s)",
                claimed.len(),
                max_idle_ms / 1000
            );
        }
        Ok(claimed)
    }

    async fn get_item(&self, url: &str) -> SpiderResult<Option<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state.data.get(&item_hash(url)).cloned())
    }

    async fn all_items(&self) -> SpiderResult<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state.data.values().cloned().collect())
    }

    async fn dead_letters(&self) -> SpiderResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead_letter.clone())
    }

    async fn stats(&self) -> SpiderResult<QueueStats> {
        let state = self.state.lock().await;
        let mut consumers: HashMap<String, usize> = HashMap::new();
        for entry in state.pending.values() {
            *consumers.entry(entry.consumer.clone()).or_default() += 1;
        }
        Ok(QueueStats {
            total_items: state.data.len(),
            stream_length: state.stream.len(),
            pending_count: state.pending.len(),
            dead_letter_count: state.dead_letter.len(),
            consumers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_dedup() {
        let queue = MemoryWorkQueue::new("test:urls");
        assert!(queue.push("https://example.com/1", None).await.expect("push"));
        assert!(!queue.push("https://example.com/1", None).await.expect("push"));
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.stream_length, 1);
    }

    #[tokio::test]
    async fn test_fetch_ack_cycle() {
        let queue = MemoryWorkQueue::new("test:urls");
        queue.push("https://example.com/1", None).await.expect("push");

        let tasks = queue.fetch("worker-1", 0, 10).await.expect("fetch");
        assert_eq!(tasks.len(), 1);
        assert_eq!(queue.stats().await.expect("stats").pending_count, 1);

        assert!(queue.ack(&tasks[0].stream_id).await.expect("ack"));
        assert_eq!(queue.stats().await.expect("stats").pending_count, 0);

        // The stream is drained; nothing more to fetch
        assert!(queue.fetch("worker-1", 0, 10).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn test_fail_keeps_pending_until_budget_exhausted() {
        let queue = MemoryWorkQueue::new("test:urls");
        queue.push("https://example.com/1", None).await.expect("push");
        let task = queue.fetch("w1", 0, 1).await.expect("fetch").remove(0);

        // Three failures within the budget leave the message pending
        for attempt in 1..=3u32 {
            queue
                .fail(&task.stream_id, &task.data_id, "boom", 3)
                .await
                .expect("fail");
            let item = queue
                .get_item("https://example.com/1")
                .await
                .expect("get")
                .expect("item");
            assert_eq!(item.metadata.retry_count, attempt);
            assert_eq!(queue.stats().await.expect("stats").pending_count, 1);
        }

        // Fourth failure exceeds the budget: acked + dead-lettered
        queue
            .fail(&task.stream_id, &task.data_id, "boom", 3)
            .await
            .expect("fail");
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.dead_letter_count, 1);
        let letters = queue.dead_letters().await.expect("dead letters");
        assert_eq!(letters[0].url, "https://example.com/1");
        assert_eq!(letters[0].retries, 3);
    }

    #[tokio::test]
    async fn test_recover_stale_claims_for_new_consumer() {
        let queue = MemoryWorkQueue::new("test:urls");
        queue.push("https://example.com/1", None).await.expect("push");
        let task = queue.fetch("dead-worker", 0, 1).await.expect("fetch").remove(0);

        // Not yet idle long enough
        assert!(queue
            .recover_stale("rescuer", 60_000, 10)
            .await
            .expect("recover")
            .is_empty());

        // With a zero idle threshold the message is claimable immediately
        let claimed = queue
            .recover_stale("rescuer", 0, 10)
            .await
            .expect("recover");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].stream_id, task.stream_id);

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.consumers.get("rescuer"), Some(&1));
        assert!(!stats.consumers.contains_key("dead-worker"));
    }

    #[tokio::test]
    async fn test_blocking_fetch_wakes_on_push() {
        let queue = Arc::new(MemoryWorkQueue::new("test:urls"));
        let fetcher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.fetch("w1", 2_000, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push("https://example.com/1", None).await.expect("push");

        let tasks = fetcher.await.expect("join").expect("fetch");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].item.url, "https://example.com/1");
    }

    #[tokio::test]
    async fn test_push_batch_counts_new_only() {
        let queue = MemoryWorkQueue::new("test:urls");
        queue.push("https://example.com/0", None).await.expect("push");
        let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/{i}")).collect();
        let inserted = queue.push_batch(&urls, None).await.expect("batch");
        assert_eq!(inserted, 4);
    }

    #[tokio::test]
    async fn test_push_batch_metadata_matched_by_position() {
        let queue = MemoryWorkQueue::new("test:urls");
        let urls = vec![
            "https://example.com/1".to_string(),
            "https://example.com/2".to_string(),
            "https://example.com/3".to_string(),
        ];
        let metadata = vec![
            WorkItemMeta {
                last_error: Some("seeded from previous run".into()),
                retry_count: 1,
                ..WorkItemMeta::default()
            },
            WorkItemMeta::default(),
        ];
        // Shorter metadata list: the tail gets default metadata
        let inserted = queue.push_batch(&urls, Some(&metadata)).await.expect("batch");
        assert_eq!(inserted, 3);

        let first = queue
            .get_item("https://example.com/1")
            .await
            .expect("get")
            .expect("item");
        assert_eq!(first.metadata.retry_count, 1);
        assert_eq!(
            first.metadata.last_error.as_deref(),
            Some("seeded from previous run")
        );
        let third = queue
            .get_item("https://example.com/3")
            .await
            .expect("get")
            .expect("item");
        assert_eq!(third.metadata, WorkItemMeta::default());
    }
}
