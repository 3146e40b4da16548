//! Detail-side extraction
//!
//! Bootstrap learns one xpath template per field from a small sample and
//! validates it; workers then apply the templates to every queued URL in
//! parallel, falling back to the learning loop when a required field slips
//! through a template.

pub mod bootstrap;
pub mod fields;
pub mod fuzzy;
pub mod learner;
pub mod record;
pub mod worker;

pub use bootstrap::learn_field_patterns;
pub use fields::{to_extraction_config, FieldExtractor};
pub use fuzzy::{find_text_matches, TextMatch};
pub use learner::learn_field_on_page;
pub use record::{CommonFieldXPath, FieldOutcome, PageExtractionRecord};
pub use worker::{append_jsonl, run_extraction_worker, WorkerStats};
