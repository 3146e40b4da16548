//! Work queue delivery guarantees: dedup, at-least-once, retry budget,
//! dead-lettering, and failover via stale recovery.

use std::sync::Arc;

use somspider::queue::{item_hash, MemoryWorkQueue, WorkQueue};

fn urls(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("https://example.com/detail/{i}"))
        .collect()
}

#[tokio::test]
async fn double_push_is_indistinguishable_from_one() {
    let queue = MemoryWorkQueue::new("test:urls");
    assert!(queue.push("https://example.com/detail/1", None).await.unwrap());
    assert!(!queue.push("https://example.com/detail/1", None).await.unwrap());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total_items, 1);
    assert_eq!(stats.stream_length, 1);

    // Exactly one delivery comes out
    let first = queue.fetch("w1", 0, 10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(queue.fetch("w1", 0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn every_pushed_url_is_delivered_exactly_once_across_consumers() {
    let queue = Arc::new(MemoryWorkQueue::new("test:urls"));
    let pushed = urls(50);
    assert_eq!(queue.push_batch(&pushed, None).await.unwrap(), 50);

    let mut delivered = Vec::new();
    let mut consumers = Vec::new();
    for name in ["a", "b", "c"] {
        let queue = Arc::clone(&queue);
        consumers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = queue.fetch(name, 50, 7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for task in batch {
                    queue.ack(&task.stream_id).await.unwrap();
                    mine.push(task.item.url);
                }
            }
            mine
        }));
    }
    for consumer in consumers {
        delivered.extend(consumer.await.unwrap());
    }

    delivered.sort();
    let mut expected = pushed.clone();
    expected.sort();
    assert_eq!(delivered, expected);
    assert_eq!(queue.stats().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn retry_budget_then_dead_letter() {
    // An extractor crashing on one URL three times (max_retries = 3): the
    // fourth failure lands it on the dead-letter stream
    let queue = MemoryWorkQueue::new("test:urls");
    queue.push("https://example.com/detail/bad", None).await.unwrap();

    let task = queue.fetch("w1", 0, 1).await.unwrap().remove(0);
    for _ in 0..3 {
        queue.fail(&task.stream_id, &task.data_id, "crash", 3).await.unwrap();
        // Still pending: a peer could reclaim and retry it
        assert_eq!(queue.stats().await.unwrap().pending_count, 1);
        assert_eq!(queue.stats().await.unwrap().dead_letter_count, 0);
    }

    queue.fail(&task.stream_id, &task.data_id, "crash", 3).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.dead_letter_count, 1);

    let letters = queue.dead_letters().await.unwrap();
    assert_eq!(letters[0].url, "https://example.com/detail/bad");
    assert_eq!(letters[0].retries, 3);

    // The data map still knows the item, so a re-push stays deduped
    assert!(!queue.push("https://example.com/detail/bad", None).await.unwrap());
    let item = queue
        .get_item("https://example.com/detail/bad")
        .await
        .unwrap()
        .unwrap();
    assert!(item.metadata.final_failed_at.is_some());
    assert_eq!(item.metadata.total_retries, Some(3));
}

#[tokio::test]
async fn crashed_consumer_work_is_reclaimed() {
    let queue = MemoryWorkQueue::new("test:urls");
    queue.push_batch(&urls(3), None).await.unwrap();

    // "dead" fetches everything and never acks
    let fetched = queue.fetch("dead", 0, 10).await.unwrap();
    assert_eq!(fetched.len(), 3);
    assert!(queue.fetch("rescuer", 0, 10).await.unwrap().is_empty());

    // Below the idle threshold nothing is claimable
    assert!(queue.recover_stale("rescuer", 60_000, 10).await.unwrap().is_empty());

    // Past it, the rescuer owns the messages and can finish them
    let reclaimed = queue.recover_stale("rescuer", 0, 10).await.unwrap();
    assert_eq!(reclaimed.len(), 3);
    for task in &reclaimed {
        queue.ack(&task.stream_id).await.unwrap();
    }
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending_count, 0);
    assert!(!stats.consumers.contains_key("rescuer"));
}

#[tokio::test]
async fn failed_message_is_retried_by_reclaiming_consumer() {
    let queue = MemoryWorkQueue::new("test:urls");
    queue.push("https://example.com/detail/flaky", None).await.unwrap();

    let task = queue.fetch("w1", 0, 1).await.unwrap().remove(0);
    queue.fail(&task.stream_id, &task.data_id, "timeout", 3).await.unwrap();

    let retried = queue.recover_stale("w2", 0, 10).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].item.metadata.retry_count, 1);
    assert_eq!(retried[0].item.metadata.last_error.as_deref(), Some("timeout"));

    queue.ack(&retried[0].stream_id).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().pending_count, 0);
}

#[test]
fn identity_is_content_addressed() {
    let a = item_hash("https://example.com/detail/1");
    assert_eq!(a, item_hash("https://example.com/detail/1"));
    assert_eq!(a.len(), 16);
    assert_ne!(a, item_hash("https://example.com/detail/2"));
}
