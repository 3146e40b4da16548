//! The list-side pipeline: navigate, explore, collect
//!
//! Three stages sharing one page. The navigator reaches the filtered list,
//! the explorer visits a sample of detail pages and induces the detail-link
//! template, and the collector harvests every page through that template
//! (or the model, when induction failed), feeding the work queue.

pub mod explorer;
pub mod harvest;
pub mod navigator;
pub mod pagination;
pub mod url_extractor;

pub use explorer::{explore_detail_pages, extract_common_detail_xpath, DetailVisit};
pub use harvest::{CollectionOutcome, UrlCollector};
pub use navigator::{replay_nav_steps, run_navigation_phase};
pub use pagination::PaginationHandler;
pub use url_extractor::{extract_url_for_mark, UrlSource};
