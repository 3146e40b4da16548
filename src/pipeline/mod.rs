//! Pipeline orchestration
//!
//! One producer (the list-side collector), one bootstrap task (field
//! template induction over the first few queued URLs), and N extraction
//! workers run as cooperative tasks in a single process, sharing only the
//! work queue and the checkpoint files. Ctrl-C cancels the root scope;
//! whatever was in flight stays pending in the queue for the next run to
//! reclaim.

pub mod events;

pub use events::{PipelineEvent, PipelineEventBus, ShutdownReason};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::actions::{ActionExecutor, NavStep};
use crate::browser::{BrowserHandle, PageHandle, SharedPage};
use crate::checkpoint::{
    CollectionConfig, CollectionConfigStore, CollectionProgress, CollectionStatus, ProgressStore,
    ResumeCoordinator,
};
use crate::collector::{
    explore_detail_pages, extract_common_detail_xpath, replay_nav_steps, run_navigation_phase,
    DetailVisit, PaginationHandler, UrlCollector,
};
use crate::config::SpiderConfig;
use crate::extractor::{
    learn_field_patterns, run_extraction_worker, to_extraction_config, CommonFieldXPath,
    FieldExtractor, WorkerStats,
};
use crate::llm::{LlmClient, OpenAiCompatClient};
use crate::queue::{FetchedTask, MemoryWorkQueue, WorkQueue};
use crate::rate::AdaptiveRateController;
use crate::task::Task;

/// Per-run options layered over the config
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub output_dir: PathBuf,
    pub headless: Option<bool>,
    pub explore_count: Option<usize>,
    pub validate_count: Option<usize>,
    pub max_pages: Option<u32>,
}

/// End-of-run report, also written to `pipeline_summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub list_url: String,
    pub task_description: String,
    pub collected_urls: usize,
    /// URLs handed to extraction
    pub total_urls: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub dead_letter_count: usize,
    pub current_page_num: u32,
    pub status: CollectionStatus,
    pub started_at: String,
    pub finished_at: String,
    pub items_file: String,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Launch a browser and an LLM client from the config and run the pipeline.
///
/// The only startup aborts: missing LLM credentials, an unusable output
/// directory, or a browser that will not launch.
pub async fn run_pipeline(
    task: Task,
    mut config: SpiderConfig,
    options: PipelineOptions,
) -> Result<PipelineSummary> {
    task.validate().context("invalid task")?;
    apply_options(&mut config, &options);

    tokio::fs::create_dir_all(&options.output_dir)
        .await
        .with_context(|| format!("cannot create output dir {:?}", options.output_dir))?;

    let llm =
        OpenAiCompatClient::new(config.llm.clone()).context("LLM credentials unavailable")?;

    let (browser, handler_task) = crate::browser::cdp::launch_browser(&config.browser).await?;

    let result = run_pipeline_with(
        &browser,
        Some(&llm),
        &task,
        &config,
        &options.output_dir,
        None,
    )
    .await;

    handler_task.abort();
    let _ = handler_task.await;
    result
}

fn apply_options(config: &mut SpiderConfig, options: &PipelineOptions) {
    if let Some(headless) = options.headless {
        config.browser.headless = headless;
    }
    if let Some(explore) = options.explore_count {
        config.collector.explore_count = explore;
        config.extractor.explore_count = explore;
    }
    if let Some(validate) = options.validate_count {
        config.extractor.validate_count = validate;
    }
    if let Some(max_pages) = options.max_pages {
        config.collector.max_pages = max_pages;
    }
}

/// Run the pipeline against caller-provided browser and LLM handles
pub async fn run_pipeline_with(
    browser: &dyn BrowserHandle,
    llm: Option<&dyn LlmClient>,
    task: &Task,
    config: &SpiderConfig,
    output_dir: &Path,
    event_bus: Option<Arc<PipelineEventBus>>,
) -> Result<PipelineSummary> {
    let started = Instant::now();
    let started_at = chrono::Utc::now().to_rfc3339();
    // Workers append here; the pipeline-level copy is consolidated at the end
    let items_path = output_dir.join("extracted_items.jsonl");
    let pipeline_items_path = output_dir.join("pipeline_extracted_items.jsonl");

    let queue = MemoryWorkQueue::new(config.queue.key_prefix.clone());
    seed_queue_from_checkpoint(&queue, output_dir, task).await;

    let (done_tx, done_rx) = watch::channel(false);
    let (patterns_tx, patterns_rx) = watch::channel::<Option<Arc<Vec<CommonFieldXPath>>>>(None);
    let bus = event_bus.as_deref();

    let producer = async {
        let outcome = run_producer(browser, llm, config, task, &queue, output_dir, bus).await;
        let _ = done_tx.send(true);
        outcome
    };

    let bootstrap = run_bootstrap(
        browser,
        llm,
        config,
        task,
        &queue,
        output_dir,
        &items_path,
        done_rx.clone(),
        patterns_tx,
        bus,
    );

    let queue_ref = &queue;
    let consumers = async {
        let mut handles = Vec::new();
        for worker_index in 0..config.pipeline.consumer_concurrency {
            let consumer_name = format!("worker-{worker_index}");
            let mut patterns_watch = patterns_rx.clone();
            let done_watch = done_rx.clone();
            let items_path = items_path.clone();
            handles.push(async move {
                // Hold new fetches until the templates exist
                let patterns = loop {
                    let ready = patterns_watch.borrow().clone();
                    if let Some(patterns) = ready {
                        break patterns;
                    }
                    if patterns_watch.changed().await.is_err() {
                        break Arc::new(Vec::new());
                    }
                };
                run_extraction_worker(
                    consumer_name,
                    browser,
                    llm,
                    config,
                    queue_ref,
                    &patterns,
                    &task.fields,
                    items_path,
                    done_watch,
                )
                .await
            });
        }
        futures::future::join_all(handles).await
    };

    let interrupted;
    let (producer_outcome, bootstrap_stats, worker_results) = tokio::select! {
        joined = async { tokio::join!(producer, bootstrap, consumers) } => {
            interrupted = false;
            joined
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, leaving queue state for the next run");
            interrupted = true;
            (
                Err(anyhow::anyhow!("interrupted")),
                WorkerStats::default(),
                Vec::new(),
            )
        }
    };

    // Fold worker tallies
    let mut success_count = bootstrap_stats.succeeded;
    let mut failed_count = bootstrap_stats.failed;
    let mut total_urls = bootstrap_stats.processed;
    for result in worker_results {
        match result {
            Ok(stats) => {
                success_count += stats.succeeded;
                failed_count += stats.failed;
                total_urls += stats.processed;
            }
            Err(e) => warn!("worker ended with error: {e}"),
        }
    }

    // Consolidate the extraction log under the pipeline's name as well
    if tokio::fs::metadata(&items_path).await.is_ok() {
        if let Err(e) = tokio::fs::copy(&items_path, &pipeline_items_path).await {
            warn!("could not consolidate extracted items: {e}");
        }
    }

    let queue_stats = queue.stats().await.unwrap_or_default();
    let (collected_urls, current_page_num, status, producer_error) = match &producer_outcome {
        Ok(outcome) => (
            outcome.collected_count,
            outcome.final_page,
            outcome.status,
            None,
        ),
        Err(e) => (0, 1, CollectionStatus::Failed, Some(e.to_string())),
    };

    let summary = PipelineSummary {
        list_url: task.list_url.clone(),
        task_description: task.task_description.clone(),
        collected_urls,
        total_urls,
        success_count,
        failed_count,
        dead_letter_count: queue_stats.dead_letter_count,
        current_page_num,
        status: if interrupted { CollectionStatus::Paused } else { status },
        started_at,
        finished_at: chrono::Utc::now().to_rfc3339(),
        items_file: pipeline_items_path.to_string_lossy().into_owned(),
        interrupted,
        error: producer_error,
    };

    if let Some(bus) = bus {
        let _ = bus.publish(PipelineEvent::pipeline_completed(
            summary.total_urls,
            summary.success_count,
            started.elapsed(),
        ));
        bus.shutdown_gracefully(if interrupted {
            ShutdownReason::Cancelled
        } else {
            ShutdownReason::PipelineCompleted
        });
    }

    let summary_path = output_dir.join("pipeline_summary.json");
    if let Err(e) = tokio::fs::write(
        &summary_path,
        serde_json::to_vec_pretty(&summary).unwrap_or_default(),
    )
    .await
    {
        warn!("could not write summary: {e}");
    }

    info!(
        "pipeline finished: {} collected, {}/{} extracted ok, {} dead-lettered",
        summary.collected_urls, summary.success_count, summary.total_urls,
        summary.dead_letter_count
    );
    Ok(summary)
}

/// Resume seam: everything in urls.txt that has no extracted item yet goes
/// back into the queue (the data-map dedup absorbs the overlap). Checkpoints
/// left by a different task are not touched.
async fn seed_queue_from_checkpoint(queue: &MemoryWorkQueue, output_dir: &Path, task: &Task) {
    let Ok(store) = ProgressStore::open(output_dir).await else {
        return;
    };
    if let Some(progress) = store.load_progress().await {
        if !progress.is_compatible(&task.list_url, &task.task_description) {
            warn!("checkpoint belongs to a different task, not seeding from it");
            return;
        }
    }
    let on_file = store.load_collected_urls().await;
    if on_file.is_empty() {
        return;
    }

    let mut extracted: HashSet<String> = HashSet::new();
    for name in ["pipeline_extracted_items.jsonl", "extracted_items.jsonl"] {
        if let Ok(content) = tokio::fs::read_to_string(output_dir.join(name)).await {
            for line in content.lines() {
                if let Ok(item) = serde_json::from_str::<serde_json::Value>(line) {
                    if let Some(url) = item.get("url").and_then(|v| v.as_str()) {
                        extracted.insert(url.to_string());
                    }
                }
            }
        }
    }

    let remaining: Vec<String> = on_file
        .into_iter()
        .filter(|url| !extracted.contains(url))
        .collect();
    if remaining.is_empty() {
        return;
    }
    match queue.push_batch(&remaining, None).await {
        Ok(seeded) => info!("seeded {seeded} unextracted URL(s) from the previous run"),
        Err(e) => warn!("could not seed queue from urls.txt: {e}"),
    }
}

/// What the producer hands back to the summary
#[derive(Debug, Clone)]
struct ProducerOutcome {
    collected_count: usize,
    final_page: u32,
    status: CollectionStatus,
}

/// The list-side producer: navigate, explore, synthesize, resume, collect
async fn run_producer(
    browser: &dyn BrowserHandle,
    llm: Option<&dyn LlmClient>,
    config: &SpiderConfig,
    task: &Task,
    queue: &dyn WorkQueue,
    output_dir: &Path,
    event_bus: Option<&PipelineEventBus>,
) -> Result<ProducerOutcome> {
    let progress_store = ProgressStore::open(output_dir).await?;
    let config_store = CollectionConfigStore::open(output_dir).await?;

    if let Some(bus) = event_bus {
        let _ = bus.publish(PipelineEvent::collect_started(task.list_url.clone()));
    }

    // Previous-run artifacts, dropped wholesale when the task changed
    let previous_config = config_store
        .load()
        .await
        .filter(|c| c.is_compatible(&task.list_url, &task.task_description));
    let stored_progress = progress_store.load_progress().await;
    let progress_mismatch = stored_progress
        .as_ref()
        .map(|p| !p.is_compatible(&task.list_url, &task.task_description))
        .unwrap_or(false);
    let previous_progress =
        stored_progress.filter(|p| p.is_compatible(&task.list_url, &task.task_description));

    // The dedup set is the union of urls.txt and the queue's data map, but
    // only when the checkpoint belongs to this task
    let mut collected: HashSet<String> = HashSet::new();
    if !progress_mismatch {
        collected.extend(progress_store.load_collected_urls().await);
        if let Ok(items) = queue.all_items().await {
            collected.extend(items.into_iter().map(|item| item.url));
        }
    }

    let is_resume = previous_progress
        .as_ref()
        .map(|p| p.current_page_num > 1)
        .unwrap_or(false);

    // Rate controller, restored from the checkpoint
    let mut rate = AdaptiveRateController::new(&config.collector);
    if let Some(progress) = &previous_progress {
        rate.set_level(progress.backoff_level);
        rate.set_consecutive_successes(progress.consecutive_success_pages);
    }

    let page: SharedPage = browser.new_page().await?;
    let goto_timeout = Duration::from_secs(config.browser.page_load_timeout_secs);
    page.goto(&task.list_url, goto_timeout)
        .await
        .map_err(|e| anyhow::anyhow!("list page unreachable: {e}"))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let step_timeout = Duration::from_millis(config.browser.step_timeout_ms);
    let mut executor = ActionExecutor::new(browser, SharedPage::clone(&page), step_timeout);

    // Navigation: replay recorded steps on resume, ask the model otherwise
    let mut nav_steps: Vec<NavStep> = previous_config
        .as_ref()
        .map(|c| c.nav_steps.clone())
        .unwrap_or_default();
    if is_resume && !nav_steps.is_empty() {
        if !replay_nav_steps(&mut executor, &nav_steps, &config.collector).await {
            warn!("nav replay failed, exploring from the landing page");
        }
    } else if let Some(llm) = llm {
        let (steps, done) =
            run_navigation_phase(&mut executor, llm, &task.task_description, &config.collector)
                .await;
        if !done {
            warn!("navigation did not declare done; collecting from the current page");
        }
        nav_steps = steps;
    }

    // Exploration and template induction, skipped when a template survives
    // from the previous run
    let mut detail_visits: Vec<DetailVisit> = Vec::new();
    let mut common_detail_xpath = previous_config
        .as_ref()
        .and_then(|c| c.common_detail_xpath.clone());
    if common_detail_xpath.is_none() {
        if let Some(llm) = llm {
            detail_visits =
                explore_detail_pages(&mut executor, llm, &task.task_description, &config.collector)
                    .await;
            if detail_visits.len() >= 2 {
                if let Some((pattern, confidence)) = extract_common_detail_xpath(&detail_visits) {
                    info!("detail-link template: {pattern} (confidence {confidence:.2})");
                    common_detail_xpath = Some(pattern);
                }
            } else {
                warn!(
                    "explored only {} detail page(s); falling back to LLM collection",
                    detail_visits.len()
                );
            }
        }
    }

    // Diagnostic snapshot of the page collection will run against
    if let Err(e) =
        crate::som::save_screenshot(executor.page().as_ref(), output_dir, "list_page").await
    {
        warn!("could not save diagnostic screenshot: {e}");
    }

    // Pagination artifacts
    let collect_page = executor.page();
    let mut pagination = PaginationHandler::new(browser, &config.collector);
    match previous_config.as_ref().and_then(|c| c.pagination_xpath.clone()) {
        Some(xpath) => pagination.pagination_xpath = Some(xpath),
        None => {
            pagination
                .extract_pagination_xpath(collect_page.as_ref(), llm)
                .await;
        }
    }
    match previous_config.as_ref().and_then(|c| c.jump_widget_xpath.clone()) {
        Some(widget) => pagination.jump_widget = Some(widget),
        None => {
            pagination.extract_jump_widget(collect_page.as_ref()).await;
        }
    }

    // Persist the exploration artifact before collection starts, so even an
    // interrupted first run resumes without the model
    let mut collection_config = CollectionConfig {
        nav_steps: nav_steps.clone(),
        common_detail_xpath: common_detail_xpath.clone(),
        pagination_xpath: pagination.pagination_xpath.clone(),
        jump_widget_xpath: pagination.jump_widget.clone(),
        list_url: task.list_url.clone(),
        task_description: task.task_description.clone(),
        ..CollectionConfig::default()
    };
    if let Err(e) = config_store.save(&mut collection_config).await {
        warn!("could not persist collection config: {e}");
    }

    // Resume to the checkpointed page
    if let Some(progress) = &previous_progress {
        if progress.current_page_num > 1 {
            let coordinator = ResumeCoordinator::new(
                &task.list_url,
                collected.clone(),
                pagination.jump_widget.clone(),
                common_detail_xpath.clone(),
                pagination.pagination_xpath.clone(),
                goto_timeout,
            );
            let actual = coordinator
                .resume_to_page(collect_page.as_ref(), progress.current_page_num)
                .await;
            pagination.current_page_num = actual;
        }
    }

    let mut progress = previous_progress
        .unwrap_or_else(|| CollectionProgress::new(&task.list_url, &task.task_description));
    progress.status = CollectionStatus::Running;
    progress.collected_count = collected.len();

    let mut collector = UrlCollector::new(
        browser,
        llm,
        &config.collector,
        queue,
        &progress_store,
        event_bus,
        rate,
        collected,
        progress,
    );

    let outcome = match &common_detail_xpath {
        Some(detail_xpath) => {
            collector
                .collect_with_xpath(collect_page.as_ref(), detail_xpath, &mut pagination)
                .await
        }
        None => {
            collector
                .collect_with_llm(&mut executor, &task.task_description, &mut pagination)
                .await
        }
    };

    // Final consolidated result
    let result_path = output_dir.join("collected_urls.json");
    let mut urls: Vec<String> = collector.collected.iter().cloned().collect();
    urls.sort();
    let payload = serde_json::json!({
        "list_url": task.list_url,
        "task_description": task.task_description,
        "urls": urls,
        "nav_steps": nav_steps,
        "detail_visits": detail_visits,
        "common_detail_xpath": common_detail_xpath,
    });
    if let Err(e) = tokio::fs::write(
        &result_path,
        serde_json::to_vec_pretty(&payload).unwrap_or_default(),
    )
    .await
    {
        warn!("could not write collected_urls.json: {e}");
    }

    let _ = page.close().await;
    Ok(ProducerOutcome {
        collected_count: outcome.collected_count,
        final_page: outcome.final_page,
        status: outcome.status,
    })
}

/// The bootstrap task: hold back the first explore+validate URLs, learn the
/// field templates on them, publish the templates, then extract the held
/// URLs itself
#[allow(clippy::too_many_arguments)]
async fn run_bootstrap(
    browser: &dyn BrowserHandle,
    llm: Option<&dyn LlmClient>,
    config: &SpiderConfig,
    task: &Task,
    queue: &dyn WorkQueue,
    output_dir: &Path,
    items_path: &Path,
    mut producer_done: watch::Receiver<bool>,
    patterns_tx: watch::Sender<Option<Arc<Vec<CommonFieldXPath>>>>,
    event_bus: Option<&PipelineEventBus>,
) -> WorkerStats {
    let needed = config.extractor.explore_count + config.extractor.validate_count;
    let mut held: Vec<FetchedTask> = Vec::new();

    // Pull the bootstrap sample off the queue
    while held.len() < needed {
        let batch = queue
            .fetch("bootstrap", config.queue.fetch_block_ms, needed - held.len())
            .await
            .unwrap_or_default();
        if batch.is_empty() {
            if *producer_done.borrow() {
                break;
            }
            let _ = tokio::time::timeout(
                Duration::from_secs_f64(config.pipeline.fetch_timeout_secs),
                producer_done.changed(),
            )
            .await;
            continue;
        }
        held.extend(batch);
    }

    let urls: Vec<String> = held.iter().map(|t| t.item.url.clone()).collect();
    let patterns = match (llm, urls.len()) {
        (Some(llm), n) if n >= 2 => {
            let explore_urls = &urls[..urls.len().min(config.extractor.explore_count)];
            let validate_urls = &urls[urls.len().min(config.extractor.explore_count)..];
            match learn_field_patterns(browser, llm, config, &task.fields, explore_urls, validate_urls)
                .await
            {
                Ok(patterns) => patterns,
                Err(e) => {
                    warn!("template bootstrap failed: {e}");
                    Vec::new()
                }
            }
        }
        _ => {
            warn!("not enough URLs ({}) or no LLM for template bootstrap", urls.len());
            Vec::new()
        }
    };

    // Persist the field → template artifact
    let extraction_config = to_extraction_config(task, &patterns);
    let config_path = output_dir.join("extraction_config.json");
    if let Err(e) = tokio::fs::write(
        &config_path,
        serde_json::to_vec_pretty(&extraction_config).unwrap_or_default(),
    )
    .await
    {
        warn!("could not write extraction_config.json: {e}");
    }

    if let Some(bus) = event_bus {
        let validated = patterns.iter().filter(|p| p.validated).count();
        let _ = bus.publish(PipelineEvent::patterns_ready(patterns.len(), validated));
    }

    let patterns = Arc::new(patterns);
    let _ = patterns_tx.send(Some(Arc::clone(&patterns)));

    // Extract the held sample so it is not lost to the workers
    let mut stats = WorkerStats::default();
    match browser.new_page().await {
        Ok(page) => {
            let extractor = FieldExtractor::new(browser, llm, config, &patterns, &task.fields);
            for held_task in held {
                stats.processed += 1;
                let record = extractor
                    .extract_from_url(SharedPage::clone(&page), &held_task.item.url)
                    .await;
                if let Some(bus) = event_bus {
                    let _ = bus.publish(PipelineEvent::extract_completed(
                        held_task.item.url.clone(),
                        record.success,
                    ));
                }
                if record.success
                    && crate::extractor::append_jsonl(items_path, &record.to_item())
                        .await
                        .is_ok()
                {
                    let _ = queue.ack(&held_task.stream_id).await;
                    stats.succeeded += 1;
                } else {
                    let _ = queue
                        .fail(
                            &held_task.stream_id,
                            &held_task.data_id,
                            &record.error_reason(),
                            config.queue.max_retries,
                        )
                        .await;
                    stats.failed += 1;
                }
            }
            let _ = page.close().await;
        }
        Err(e) => {
            warn!("bootstrap could not open a page, failing held tasks: {e}");
            for held_task in held {
                stats.processed += 1;
                stats.failed += 1;
                let _ = queue
                    .fail(
                        &held_task.stream_id,
                        &held_task.data_id,
                        &format!("bootstrap page unavailable: {e}"),
                        config.queue.max_retries,
                    )
                    .await;
            }
        }
    }
    stats
}
