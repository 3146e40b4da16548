//! Set-of-Mark page annotation
//!
//! The injected scanner turns a page into a [`SoMSnapshot`] of numbered
//! interactive elements; the validator and text-first resolver turn LLM
//! claims about those numbers back into trustworthy mark ids.

pub mod inject;
pub mod snapshot;
pub mod text_first;
pub mod validator;

pub use inject::{
    build_mark_id_to_xpath_map, capture_screenshot_base64, capture_screenshot_with_custom_marks,
    clear_overlay, format_marks_for_llm, inject_and_scan, save_screenshot, CustomMark,
};
pub use snapshot::{BoundingBox, ElementMark, ScrollInfo, SoMSnapshot, XPathCandidate, XPathStrategy};
pub use text_first::{disambiguate_by_text, resolve_mark_ids_from_map, resolve_single_mark_id};
pub use validator::{MarkIdValidationResult, MarkIdValidator, MatchStatus};
