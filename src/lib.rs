//! somspider — vision-assisted web crawler
//!
//! Point it at a list page with a natural-language task and field
//! definitions. It explores a few detail pages under vision+LLM guidance,
//! induces robust XPath templates from those visits, then switches to fast
//! template-driven collection with a parallel extraction stage backed by a
//! reliable work queue with at-least-once delivery.

pub mod actions;
pub mod browser;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod pattern;
pub mod pipeline;
pub mod queue;
pub mod rate;
pub mod som;
pub mod task;
pub mod utils;

pub use actions::{Action, ActionExecutor, ActionResult, NavStep};
pub use browser::{BrowserHandle, PageHandle, SharedBrowser, SharedPage};
pub use checkpoint::{
    CollectionConfig, CollectionProgress, CollectionStatus, JumpWidget, ProgressStore,
    ResumeCoordinator,
};
pub use collector::{DetailVisit, PaginationHandler, UrlCollector};
pub use config::SpiderConfig;
pub use error::{SpiderError, SpiderResult};
pub use extractor::{CommonFieldXPath, FieldExtractor, FieldOutcome, PageExtractionRecord};
pub use llm::{LlmClient, OpenAiCompatClient};
pub use pattern::PatternSynthesizer;
pub use pipeline::{run_pipeline, run_pipeline_with, PipelineOptions, PipelineSummary};
pub use queue::{MemoryWorkQueue, QueueStats, WorkItem, WorkQueue};
pub use rate::AdaptiveRateController;
pub use som::{SoMSnapshot, XPathCandidate, XPathStrategy};
pub use task::{DataType, FieldDefinition, Task};
