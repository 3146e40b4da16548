//! Configuration sections and their defaults

use serde::{Deserialize, Serialize};

/// LLM endpoint configuration (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    /// Optional cheaper model for planning-only calls (pattern synthesis,
    /// value validation). Falls back to `model` when unset.
    pub planner_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            planner_model: None,
            temperature: 0.1,
            max_tokens: 8192,
            request_timeout_secs: 120,
        }
    }
}

/// Browser session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Timeout applied to individual page operations (goto, click, locator)
    pub step_timeout_ms: u64,
    /// Timeout for `page.goto` navigation specifically
    pub page_load_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            step_timeout_ms: 30_000,
            page_load_timeout_secs: 30,
        }
    }
}

/// List-side collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Detail pages visited during exploration
    pub explore_count: usize,
    /// Navigation-phase LLM step budget
    pub max_nav_steps: usize,
    /// Scroll attempts per list page in LLM mode
    pub max_scrolls: usize,
    /// Consecutive empty snapshots before the scroll loop gives up
    pub no_new_url_threshold: usize,
    /// Stop collecting once this many URLs are on file
    pub target_url_count: usize,
    /// Maximum pages to paginate through
    pub max_pages: u32,

    /// Base delay before each page action, in seconds
    pub action_delay_base: f64,
    /// Uniform jitter added to the base delay, in seconds
    pub action_delay_random: f64,
    /// Settle time after a pagination click, in seconds
    pub page_load_delay: f64,
    /// Settle time after a scroll, in seconds
    pub scroll_delay: f64,

    /// Attempts at the overlay-renumber disambiguation sub-flow
    pub max_validation_retries: usize,

    /// Backoff multiplier applied per rate-controller level
    pub backoff_factor: f64,
    /// Maximum rate-controller level
    pub max_backoff_level: u32,
    /// Consecutive successful pages required to recover one level
    pub credit_recovery_pages: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            explore_count: 3,
            max_nav_steps: 10,
            max_scrolls: 5,
            no_new_url_threshold: 2,
            target_url_count: 400,
            max_pages: 40,
            action_delay_base: 1.0,
            action_delay_random: 0.5,
            page_load_delay: 1.5,
            scroll_delay: 0.5,
            max_validation_retries: 1,
            backoff_factor: 1.5,
            max_backoff_level: 3,
            credit_recovery_pages: 5,
        }
    }
}

/// Work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Namespace prefix for the queue's key spaces
    pub key_prefix: String,
    /// Unacked messages older than this are claimable by other consumers
    pub max_idle_ms: u64,
    /// Messages fetched per consumer pull
    pub fetch_batch_size: usize,
    /// Blocking wait per fetch, in milliseconds
    pub fetch_block_ms: u64,
    /// Retry budget before an item dead-letters
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "somspider:urls".to_string(),
            max_idle_ms: 300_000,
            fetch_batch_size: 10,
            fetch_block_ms: 5_000,
            max_retries: 3,
        }
    }
}

/// Detail-side extractor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Pages used to induce per-field patterns
    pub explore_count: usize,
    /// Pages used to validate induced patterns
    pub validate_count: usize,
    /// Field-navigation LLM step budget
    pub max_nav_steps: usize,
    /// Similarity threshold for fuzzy text-node matching
    pub fuzzy_match_threshold: f64,
    /// Fraction of the validation sample a required-field pattern must pass
    pub validation_pass_ratio: f64,
    /// Per-field locator read timeout, in milliseconds
    pub field_timeout_ms: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            explore_count: 3,
            validate_count: 2,
            max_nav_steps: 10,
            fuzzy_match_threshold: 0.8,
            validation_pass_ratio: 0.8,
            field_timeout_ms: 5_000,
        }
    }
}

/// Producer/consumer pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of extractor workers, each owning one page
    pub consumer_concurrency: usize,
    /// Tasks pulled per consumer fetch
    pub batch_fetch_size: usize,
    /// Fetch wait before re-checking the producer-done flag, in seconds
    pub fetch_timeout_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consumer_concurrency: 3,
            batch_fetch_size: 20,
            fetch_timeout_secs: 5.0,
        }
    }
}

/// Top-level configuration passed to every component at construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl SpiderConfig {
    /// The model used for planning-only calls
    #[must_use]
    pub fn planner_model(&self) -> &str {
        self.llm.planner_model.as_deref().unwrap_or(&self.llm.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_json() {
        let config = SpiderConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: SpiderConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.collector.explore_count, 3);
        assert_eq!(back.queue.max_idle_ms, 300_000);
        assert!((back.extractor.validation_pass_ratio - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_planner_model_fallback() {
        let mut config = SpiderConfig::default();
        assert_eq!(config.planner_model(), "gpt-4o");
        config.llm.planner_model = Some("gpt-4o-mini".into());
        assert_eq!(config.planner_model(), "gpt-4o-mini");
    }
}
