//! Pipeline event bus
//!
//! Lifecycle events on a broadcast channel so the CLI (or anything else) can
//! watch progress without coupling to the stages. Publishing to an empty bus
//! is an error the stages downgrade to a debug log; a full receiver lags and
//! keeps going.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why the bus shut down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShutdownReason {
    PipelineCompleted,
    Error(String),
    Cancelled,
}

/// Events emitted while the pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    CollectStarted {
        list_url: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    PageHarvested {
        page_num: u32,
        new_urls: usize,
        total_urls: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    PatternsReady {
        field_count: usize,
        validated_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ExtractCompleted {
        url: String,
        success: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    PipelineCompleted {
        total_urls: usize,
        success_count: usize,
        duration: std::time::Duration,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Subscribers should exit their loops on this event
    Shutdown {
        reason: ShutdownReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PipelineEvent {
    #[must_use]
    pub fn collect_started(list_url: String) -> Self {
        Self::CollectStarted {
            list_url,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn page_harvested(page_num: u32, new_urls: usize, total_urls: usize) -> Self {
        Self::PageHarvested {
            page_num,
            new_urls,
            total_urls,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn patterns_ready(field_count: usize, validated_count: usize) -> Self {
        Self::PatternsReady {
            field_count,
            validated_count,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn extract_completed(url: String, success: bool) -> Self {
        Self::ExtractCompleted {
            url,
            success,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn pipeline_completed(
        total_urls: usize,
        success_count: usize,
        duration: std::time::Duration,
    ) -> Self {
        Self::PipelineCompleted {
            total_urls,
            success_count,
            duration,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn shutdown(reason: ShutdownReason) -> Self {
        Self::Shutdown {
            reason,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Publish-side failure modes
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// No active subscribers when publishing
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Counters exposed for the end-of-run report
#[derive(Debug, Clone, Default)]
pub struct EventBusMetrics {
    pub events_published: u64,
    pub events_failed: u64,
    pub active_subscribers: usize,
}

/// Broadcast-backed event bus
pub struct PipelineEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl PipelineEventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            sender,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Publish one event. Failure here means nobody is listening, which the
    /// stages treat as ignorable.
    pub fn publish(&self, event: PipelineEvent) -> Result<usize, EventBusError> {
        match self.sender.send(event) {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(receivers)
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(EventBusError::NoSubscribers)
            }
        }
    }

    /// Publish the shutdown event so subscriber loops exit
    pub fn shutdown_gracefully(&self, reason: ShutdownReason) {
        let _ = self.publish(PipelineEvent::shutdown(reason));
    }

    #[must_use]
    pub fn metrics(&self) -> EventBusMetrics {
        EventBusMetrics {
            events_published: self.published.load(Ordering::Relaxed),
            events_failed: self.failed.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_errors() {
        let bus = PipelineEventBus::new(16);
        let result = bus.publish(PipelineEvent::collect_started("https://example.com".into()));
        assert!(matches!(result, Err(EventBusError::NoSubscribers)));
        assert_eq!(bus.metrics().events_failed, 1);
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let bus = PipelineEventBus::new(16);
        let mut receiver = bus.subscribe();
        assert!(bus.has_subscribers());

        bus.publish(PipelineEvent::page_harvested(2, 10, 20)).expect("publish");
        match receiver.recv().await.expect("receive") {
            PipelineEvent::PageHarvested { page_num, new_urls, total_urls, .. } => {
                assert_eq!((page_num, new_urls, total_urls), (2, 10, 20));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_reaches_subscribers() {
        let bus = PipelineEventBus::new(16);
        let mut receiver = bus.subscribe();
        bus.shutdown_gracefully(ShutdownReason::PipelineCompleted);
        assert!(matches!(
            receiver.recv().await.expect("receive"),
            PipelineEvent::Shutdown { .. }
        ));
    }
}
