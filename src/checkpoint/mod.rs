//! Checkpointing and resume
//!
//! Everything a run persists between pages lives here: the per-page
//! progress snapshot, the append-only URL log, the exploration artifact,
//! and the strategies that put a resumed run back on the right page.

pub mod config_store;
pub mod progress;
pub mod resume;

pub use config_store::{CollectionConfig, CollectionConfigStore, JumpWidget};
pub use progress::{CollectionProgress, CollectionStatus, ProgressStore};
pub use resume::{
    ResumeCoordinator, ResumeStrategy, SmartSkipStrategy, UrlPatternStrategy, WidgetJumpStrategy,
};
