//! Queue consumer loop
//!
//! Each worker owns one page and pulls small batches off the shared queue.
//! Success acks; failure calls `fail`, which leaves the message pending for
//! retry or dead-letters it past the budget. Before giving up on an empty
//! stream, a worker tries to reclaim messages stranded by crashed peers.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::browser::{BrowserHandle, PageHandle};
use crate::config::SpiderConfig;
use crate::error::{SpiderError, SpiderResult};
use crate::llm::LlmClient;
use crate::queue::{FetchedTask, WorkQueue};
use crate::task::FieldDefinition;

use super::fields::FieldExtractor;
use super::record::CommonFieldXPath;

/// Per-worker tallies, merged into the pipeline summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reclaimed: usize,
}

/// Append one JSON object as a line; the single write is the atomic unit
pub async fn append_jsonl(path: &Path, item: &serde_json::Value) -> SpiderResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SpiderError::Checkpoint(format!("create {parent:?}: {e}")))?;
    }
    let mut line = serde_json::to_string(item)
        .map_err(|e| SpiderError::Checkpoint(format!("encode item: {e}")))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| SpiderError::Checkpoint(format!("open {path:?}: {e}")))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| SpiderError::Checkpoint(format!("append {path:?}: {e}")))?;
    file.flush()
        .await
        .map_err(|e| SpiderError::Checkpoint(format!("flush {path:?}: {e}")))?;
    Ok(())
}

/// Run one extraction worker until the producer is done and the stream is
/// drained
#[allow(clippy::too_many_arguments)]
pub async fn run_extraction_worker(
    consumer_name: String,
    browser: &dyn BrowserHandle,
    llm: Option<&dyn LlmClient>,
    config: &SpiderConfig,
    queue: &dyn WorkQueue,
    patterns: &[CommonFieldXPath],
    fields: &[FieldDefinition],
    items_path: PathBuf,
    mut producer_done: watch::Receiver<bool>,
) -> SpiderResult<WorkerStats> {
    let page = browser.new_page().await?;
    let extractor = FieldExtractor::new(browser, llm, config, patterns, fields);
    let mut stats = WorkerStats::default();

    info!("[{consumer_name}] extraction worker started");
    loop {
        let mut batch = queue
            .fetch(
                &consumer_name,
                config.queue.fetch_block_ms,
                config.pipeline.batch_fetch_size,
            )
            .await?;

        if batch.is_empty() {
            // Reclaim work stranded by crashed or stalled peers
            let reclaimed = queue
                .recover_stale(
                    &consumer_name,
                    config.queue.max_idle_ms,
                    config.pipeline.batch_fetch_size,
                )
                .await?;
            stats.reclaimed += reclaimed.len();
            batch = reclaimed;
        }

        if batch.is_empty() {
            if *producer_done.borrow() {
                // Nothing new, nothing stale to reclaim: whatever is still
                // pending belongs to an active peer or waits for a later
                // run to reclaim it
                break;
            }
            // Producer still running; wait for either new work (next fetch
            // blocks) or the done flag
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs_f64(config.pipeline.fetch_timeout_secs),
                producer_done.changed(),
            )
            .await;
            continue;
        }

        for task in batch {
            process_task(
                &consumer_name,
                &extractor,
                queue,
                config,
                &items_path,
                &page,
                task,
                &mut stats,
            )
            .await;
        }
    }

    let _ = page.close().await;
    info!(
        "[{consumer_name}] worker done: {} processed, {} ok, {} failed, {} reclaimed",
        stats.processed, stats.succeeded, stats.failed, stats.reclaimed
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn process_task(
    consumer_name: &str,
    extractor: &FieldExtractor<'_>,
    queue: &dyn WorkQueue,
    config: &SpiderConfig,
    items_path: &Path,
    page: &crate::browser::SharedPage,
    task: FetchedTask,
    stats: &mut WorkerStats,
) {
    stats.processed += 1;
    let record = extractor
        .extract_from_url(crate::browser::SharedPage::clone(page), &task.item.url)
        .await;

    if record.success {
        if let Err(e) = append_jsonl(items_path, &record.to_item()).await {
            // The result could not be persisted; treat as failure so the
            // item is retried rather than lost
            warn!("[{consumer_name}] could not persist {}: {e}", task.item.url);
            let _ = queue
                .fail(
                    &task.stream_id,
                    &task.data_id,
                    &format!("persist failed: {e}"),
                    config.queue.max_retries,
                )
                .await;
            stats.failed += 1;
            return;
        }
        if let Err(e) = queue.ack(&task.stream_id).await {
            warn!("[{consumer_name}] ack failed for {}: {e}", task.item.url);
        }
        stats.succeeded += 1;
    } else {
        let reason = record.error_reason();
        if let Err(e) = queue
            .fail(&task.stream_id, &task.data_id, &reason, config.queue.max_retries)
            .await
        {
            warn!("[{consumer_name}] fail-mark failed for {}: {e}", task.item.url);
        }
        stats.failed += 1;
    }
}
