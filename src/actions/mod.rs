//! Abstract browser actions and their replay records
//!
//! LLM decisions are normalised into [`Action`] values, executed by
//! [`executor::ActionExecutor`], and — when they succeed and matter for
//! replay — recorded as [`NavStep`]s with enough xpath candidates to survive
//! minor DOM drift.

pub mod executor;

pub use executor::ActionExecutor;

use serde::{Deserialize, Serialize};

/// One abstract browser action, tagged by `action` on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        mark_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_text: Option<String>,
    },
    Type {
        mark_id: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_text: Option<String>,
        /// What the step is expected to achieve; used for Enter inference
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expectation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    Press {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mark_id: Option<u64>,
        key: String,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<(f64, f64)>,
    },
    Navigate {
        url: String,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Extract {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mark_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_text: Option<String>,
    },
    GoBack,
    GoBackTab,
    Done,
    Retry,
}

impl Action {
    /// Wire name of the variant
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Press { .. } => "press",
            Self::Scroll { .. } => "scroll",
            Self::Navigate { .. } => "navigate",
            Self::Wait { .. } => "wait",
            Self::Extract { .. } => "extract",
            Self::GoBack => "go_back",
            Self::GoBackTab => "go_back_tab",
            Self::Done => "done",
            Self::Retry => "retry",
        }
    }
}

/// What came back from executing one action. Failures are values here, not
/// errors; the executor never raises past its boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

impl ActionResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ok_at(url: impl Into<String>) -> Self {
        Self {
            success: true,
            new_url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Replay record of one successful navigation action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavStep {
    pub step: usize,
    /// Wire name of the action taken
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_xpath: Option<String>,
    /// Up to five ranked fallback locators for replay
    #[serde(default)]
    pub xpath_alternatives: Vec<String>,
    /// Visible text of the element acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Typed value, for type steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// URL the page was on after the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tagged_serialization() {
        let action = Action::Click {
            mark_id: 12,
            target_text: Some("查看详情".into()),
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["action"], "click");
        assert_eq!(json["mark_id"], 12);

        let back: Action = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind(), "click");
    }

    #[test]
    fn test_unit_variants_roundtrip() {
        for (action, kind) in [
            (Action::GoBackTab, "go_back_tab"),
            (Action::Done, "done"),
            (Action::Retry, "retry"),
        ] {
            let json = serde_json::to_value(&action).expect("serialize");
            assert_eq!(json["action"], kind);
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result: Result<Action, _> =
            serde_json::from_value(serde_json::json!({"action": "teleport"}));
        assert!(result.is_err());
    }
}
