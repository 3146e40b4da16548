//! XPath pattern induction and validation
//!
//! [`synthesizer`] turns per-page xpaths into one reusable template;
//! [`validate`] proves the template on live sample pages before the
//! collector trusts it at scale.

pub mod segments;
pub mod synthesizer;
pub mod validate;

pub use segments::{normalize_for_comparison, parse_xpath_segments, Segment};
pub use synthesizer::{
    dominant_exact, fold_detail_xpath, is_over_broad, merge_from_candidates,
    normalized_match_ratio, pattern_confidence, smart_merge, stability_score,
    suffix_aligned_merge, union_pattern, PatternSynthesizer, SynthesizedPattern,
};
pub use validate::{is_type_valid, looks_like_date, looks_like_number, looks_like_url,
    validate_xpath_pattern};
