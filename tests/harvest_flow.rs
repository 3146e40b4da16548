//! Template-mode collection across a scripted three-page list: the happy
//! path (30 links over 3 pages), termination without a next control, and
//! the no-stall guarantee when every link is already known.

mod common;

use std::collections::HashSet;

use common::{FakeBrowser, FakeElement, FakePage};
use somspider::checkpoint::{CollectionProgress, CollectionStatus, ProgressStore};
use somspider::collector::{PaginationHandler, UrlCollector};
use somspider::config::CollectorConfig;
use somspider::queue::{MemoryWorkQueue, WorkQueue};
use somspider::rate::AdaptiveRateController;

const DETAIL_XPATH: &str = "//section//ul/li/a";
const NEXT_XPATH: &str = "//a[@class='page-next']";

fn fast_config() -> CollectorConfig {
    CollectorConfig {
        action_delay_base: 0.0,
        action_delay_random: 0.0,
        page_load_delay: 0.0,
        scroll_delay: 0.0,
        ..CollectorConfig::default()
    }
}

fn page_elements(page_num: usize, with_next: bool) -> Vec<FakeElement> {
    let mut elements: Vec<FakeElement> = (0..10)
        .map(|i| {
            FakeElement::new(DETAIL_XPATH, "a", &format!("entry {page_num}-{i}"))
                .with_attr("href", &format!("/detail/{}", page_num * 10 + i))
        })
        .collect();
    if with_next {
        elements.push(
            FakeElement::new(NEXT_XPATH, "a", "下一页").with_attr("class", "page-next"),
        );
    }
    elements
}

fn three_page_site() -> std::sync::Arc<FakePage> {
    let page = FakePage::new(
        "list",
        "https://example.com/list?page=1",
        page_elements(0, true),
    );
    page.set_flow(
        NEXT_XPATH,
        vec![
            ("https://example.com/list?page=2".to_string(), page_elements(1, true)),
            ("https://example.com/list?page=3".to_string(), page_elements(2, false)),
        ],
    );
    page
}

#[tokio::test]
async fn three_pages_harvest_thirty_urls_and_complete() {
    let page = three_page_site();
    let browser = FakeBrowser::new(vec![page.clone()]);
    let queue = MemoryWorkQueue::new("test:urls");
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::open(dir.path()).await.unwrap();
    let config = fast_config();

    let mut pagination = PaginationHandler::new(&browser, &config);
    pagination.pagination_xpath = Some(NEXT_XPATH.to_string());

    let mut collector = UrlCollector::new(
        &browser,
        None,
        &config,
        &queue,
        &store,
        None,
        AdaptiveRateController::new(&config),
        HashSet::new(),
        CollectionProgress::new("https://example.com/list?page=1", "collect"),
    );

    let outcome = collector
        .collect_with_xpath(page.as_ref(), DETAIL_XPATH, &mut pagination)
        .await;

    assert_eq!(outcome.status, CollectionStatus::Completed);
    assert_eq!(outcome.collected_count, 30);
    assert_eq!(outcome.final_page, 3);

    // urls.txt carries exactly the 30 distinct URLs
    let on_file = store.load_collected_urls().await;
    assert_eq!(on_file.len(), 30);
    let distinct: HashSet<&String> = on_file.iter().collect();
    assert_eq!(distinct.len(), 30);

    // Every URL was offered to the queue exactly once
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total_items, 30);
    assert_eq!(stats.stream_length, 30);

    // The checkpoint reflects the final page and status
    let progress = store.load_progress().await.unwrap();
    assert_eq!(progress.current_page_num, 3);
    assert_eq!(progress.status, CollectionStatus::Completed);
    assert_eq!(progress.collected_count, 30);
}

#[tokio::test]
async fn single_page_without_next_completes_quietly() {
    let page = FakePage::new(
        "list",
        "https://example.com/list",
        page_elements(0, false),
    );
    let browser = FakeBrowser::new(vec![page.clone()]);
    let queue = MemoryWorkQueue::new("test:urls");
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::open(dir.path()).await.unwrap();
    let config = fast_config();

    let mut pagination = PaginationHandler::new(&browser, &config);

    let mut collector = UrlCollector::new(
        &browser,
        None,
        &config,
        &queue,
        &store,
        None,
        AdaptiveRateController::new(&config),
        HashSet::new(),
        CollectionProgress::new("https://example.com/list", "collect"),
    );

    let outcome = collector
        .collect_with_xpath(page.as_ref(), DETAIL_XPATH, &mut pagination)
        .await;
    assert_eq!(outcome.status, CollectionStatus::Completed);
    assert_eq!(outcome.collected_count, 10);
    assert_eq!(outcome.final_page, 1);
}

#[tokio::test]
async fn already_collected_links_do_not_stall_pagination() {
    let page = three_page_site();
    let browser = FakeBrowser::new(vec![page.clone()]);
    let queue = MemoryWorkQueue::new("test:urls");
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::open(dir.path()).await.unwrap();
    let config = fast_config();

    // Everything was already collected by a previous run
    let collected: HashSet<String> = (0..30)
        .map(|i| format!("https://example.com/detail/{i}"))
        .collect();

    let mut pagination = PaginationHandler::new(&browser, &config);
    pagination.pagination_xpath = Some(NEXT_XPATH.to_string());

    let mut progress = CollectionProgress::new("https://example.com/list?page=1", "collect");
    progress.collected_count = collected.len();

    let mut collector = UrlCollector::new(
        &browser,
        None,
        &config,
        &queue,
        &store,
        None,
        AdaptiveRateController::new(&config),
        collected,
        progress,
    );

    let outcome = collector
        .collect_with_xpath(page.as_ref(), DETAIL_XPATH, &mut pagination)
        .await;

    // It walked all three pages without finding anything new, and finished
    assert_eq!(outcome.status, CollectionStatus::Completed);
    assert_eq!(outcome.final_page, 3);
    assert_eq!(queue.stats().await.unwrap().total_items, 0);
    assert!(store.load_collected_urls().await.is_empty());
}
