//! Set-of-Mark snapshot types
//!
//! A snapshot is what the page-side scanner returns: every interactive
//! element annotated with an integer mark, its geometry, its visible text,
//! and a ranked list of XPath candidates for later replay.

use serde::{Deserialize, Serialize};

/// How an XPath candidate anchors the element. Variants are ordered from
/// most to least stable; lower `priority` numbers mean the same thing on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum XPathStrategy {
    #[serde(rename = "id")]
    Id,
    #[serde(rename = "testid")]
    TestId,
    #[serde(rename = "id-relative")]
    IdRelative,
    #[serde(rename = "id-class-relative")]
    IdClassRelative,
    #[serde(rename = "class-anchor")]
    ClassAnchor,
    #[serde(rename = "data-attr")]
    DataAttr,
    #[serde(rename = "absolute")]
    Absolute,
}

impl XPathStrategy {
    /// Merge order used by the pattern synthesizer, most stable first
    pub const PRIORITY_ORDER: [Self; 7] = [
        Self::Id,
        Self::TestId,
        Self::IdRelative,
        Self::IdClassRelative,
        Self::ClassAnchor,
        Self::DataAttr,
        Self::Absolute,
    ];
}

/// One locating expression for a mark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XPathCandidate {
    pub xpath: String,
    pub priority: u32,
    pub strategy: XPathStrategy,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// Viewport-pixel bounding box
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Document scroll state at snapshot time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrollInfo {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
    pub is_at_top: bool,
    pub is_at_bottom: bool,
    pub can_scroll_up: bool,
    pub can_scroll_down: bool,
}

/// One marked interactive element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementMark {
    pub mark_id: u64,
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub aria_label: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub bbox: BoundingBox,
    /// Element center in [0,1] viewport coordinates
    #[serde(default)]
    pub center_normalized: (f64, f64),
    /// Ranked locators; the scanner guarantees at least one
    #[serde(default)]
    pub xpath_candidates: Vec<XPathCandidate>,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

impl ElementMark {
    /// The first non-empty of innerText, aria-label, placeholder, title,
    /// value — the text a vision model is assumed to have read
    #[must_use]
    pub fn effective_text(&self) -> &str {
        let candidates = [
            Some(self.text.as_str()),
            self.aria_label.as_deref(),
            self.placeholder.as_deref(),
            self.title.as_deref(),
            self.value.as_deref(),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .unwrap_or("")
    }
}

/// The full page annotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoMSnapshot {
    pub url: String,
    pub title: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub marks: Vec<ElementMark>,
    #[serde(default)]
    pub scroll_info: Option<ScrollInfo>,
    #[serde(default)]
    pub timestamp: i64,
}

impl SoMSnapshot {
    #[must_use]
    pub fn mark(&self, mark_id: u64) -> Option<&ElementMark> {
        self.marks.iter().find(|m| m.mark_id == mark_id)
    }

    /// Whether the snapshot says the page cannot scroll further down
    #[must_use]
    pub fn at_bottom(&self) -> bool {
        self.scroll_info
            .as_ref()
            .map(|s| s.is_at_bottom)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_text_order() {
        let mut mark = ElementMark {
            mark_id: 1,
            tag: "a".into(),
            role: None,
            text: "  ".into(),
            aria_label: Some("open detail".into()),
            placeholder: None,
            title: None,
            value: None,
            href: None,
            input_type: None,
            bbox: BoundingBox::default(),
            center_normalized: (0.5, 0.5),
            xpath_candidates: vec![],
            is_visible: true,
        };
        assert_eq!(mark.effective_text(), "open detail");
        mark.text = "查看详情".into();
        assert_eq!(mark.effective_text(), "查看详情");
    }

    #[test]
    fn test_strategy_wire_names() {
        let json = serde_json::to_string(&XPathStrategy::IdClassRelative).expect("serialize");
        assert_eq!(json, "\"id-class-relative\"");
        let back: XPathStrategy = serde_json::from_str("\"class-anchor\"").expect("deserialize");
        assert_eq!(back, XPathStrategy::ClassAnchor);
    }

    #[test]
    fn test_strategy_order_is_stability_order() {
        assert!(XPathStrategy::Id < XPathStrategy::Absolute);
        assert!(XPathStrategy::TestId < XPathStrategy::ClassAnchor);
    }
}
