//! One-shot environment binding
//!
//! The binary calls [`from_env`] exactly once at startup; everything past
//! this point receives the resulting `SpiderConfig` by value.

use std::env;

use super::types::SpiderConfig;

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

/// Build a config from defaults overlaid with environment variables
#[must_use]
pub fn from_env() -> SpiderConfig {
    let mut config = SpiderConfig::default();

    if let Some(v) = env_string("SOMSPIDER_API_KEY") {
        config.llm.api_key = v;
    }
    if let Some(v) = env_string("SOMSPIDER_API_BASE") {
        config.llm.api_base = v;
    }
    if let Some(v) = env_string("SOMSPIDER_MODEL") {
        config.llm.model = v;
    }
    if let Some(v) = env_string("SOMSPIDER_PLANNER_MODEL") {
        config.llm.planner_model = Some(v);
    }

    if let Some(v) = env_parse("HEADLESS") {
        config.browser.headless = v;
    }
    if let Some(v) = env_parse("VIEWPORT_WIDTH") {
        config.browser.viewport_width = v;
    }
    if let Some(v) = env_parse("VIEWPORT_HEIGHT") {
        config.browser.viewport_height = v;
    }
    if let Some(v) = env_parse("STEP_TIMEOUT_MS") {
        config.browser.step_timeout_ms = v;
    }

    if let Some(v) = env_parse("EXPLORE_COUNT") {
        config.collector.explore_count = v;
    }
    if let Some(v) = env_parse("MAX_NAV_STEPS") {
        config.collector.max_nav_steps = v;
    }
    if let Some(v) = env_parse("MAX_SCROLLS") {
        config.collector.max_scrolls = v;
    }
    if let Some(v) = env_parse("NO_NEW_URL_THRESHOLD") {
        config.collector.no_new_url_threshold = v;
    }
    if let Some(v) = env_parse("TARGET_URL_COUNT") {
        config.collector.target_url_count = v;
    }
    if let Some(v) = env_parse("MAX_PAGES") {
        config.collector.max_pages = v;
    }
    if let Some(v) = env_parse("ACTION_DELAY_BASE") {
        config.collector.action_delay_base = v;
    }
    if let Some(v) = env_parse("ACTION_DELAY_RANDOM") {
        config.collector.action_delay_random = v;
    }
    if let Some(v) = env_parse("PAGE_LOAD_DELAY") {
        config.collector.page_load_delay = v;
    }
    if let Some(v) = env_parse("BACKOFF_FACTOR") {
        config.collector.backoff_factor = v;
    }
    if let Some(v) = env_parse("MAX_BACKOFF_LEVEL") {
        config.collector.max_backoff_level = v;
    }
    if let Some(v) = env_parse("CREDIT_RECOVERY_PAGES") {
        config.collector.credit_recovery_pages = v;
    }

    if let Some(v) = env_string("QUEUE_KEY_PREFIX") {
        config.queue.key_prefix = v;
    }
    if let Some(v) = env_parse("QUEUE_MAX_IDLE_MS") {
        config.queue.max_idle_ms = v;
    }
    if let Some(v) = env_parse("QUEUE_FETCH_BATCH_SIZE") {
        config.queue.fetch_batch_size = v;
    }
    if let Some(v) = env_parse("QUEUE_FETCH_BLOCK_MS") {
        config.queue.fetch_block_ms = v;
    }
    if let Some(v) = env_parse("QUEUE_MAX_RETRIES") {
        config.queue.max_retries = v;
    }

    if let Some(v) = env_parse("FIELD_EXPLORE_COUNT") {
        config.extractor.explore_count = v;
    }
    if let Some(v) = env_parse("FIELD_VALIDATE_COUNT") {
        config.extractor.validate_count = v;
    }
    if let Some(v) = env_parse("FIELD_MAX_NAV_STEPS") {
        config.extractor.max_nav_steps = v;
    }
    if let Some(v) = env_parse("FIELD_FUZZY_THRESHOLD") {
        config.extractor.fuzzy_match_threshold = v;
    }
    if let Some(v) = env_parse("FIELD_VALIDATION_PASS_RATIO") {
        config.extractor.validation_pass_ratio = v;
    }

    if let Some(v) = env_parse("PIPELINE_CONSUMER_CONCURRENCY") {
        config.pipeline.consumer_concurrency = v;
    }
    if let Some(v) = env_parse("PIPELINE_BATCH_FETCH_SIZE") {
        config.pipeline.batch_fetch_size = v;
    }
    if let Some(v) = env_parse("PIPELINE_FETCH_TIMEOUT") {
        config.pipeline.fetch_timeout_secs = v;
    }

    config
}
