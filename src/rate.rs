//! Adaptive rate control
//!
//! Exponential backoff with credit recovery: every penalty raises the level
//! (clamped at `max_level`) and the delay grows by `backoff_factor ^ level`;
//! enough consecutive fully-successful pages earn one level back. The level
//! and success counter are checkpointed alongside collection progress.

use std::time::Duration;

use log::{info, warn};

use crate::config::CollectorConfig;
use crate::utils::jittered_delay;

/// Per-collector adaptive rate controller
#[derive(Debug, Clone)]
pub struct AdaptiveRateController {
    base_delay: f64,
    jitter: f64,
    backoff_factor: f64,
    max_level: u32,
    credit_recovery_pages: u32,
    level: u32,
    consecutive_successes: u32,
}

impl AdaptiveRateController {
    #[must_use]
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            base_delay: config.action_delay_base,
            jitter: config.action_delay_random,
            backoff_factor: config.backoff_factor,
            max_level: config.max_backoff_level,
            credit_recovery_pages: config.credit_recovery_pages,
            level: 0,
            consecutive_successes: 0,
        }
    }

    /// Current backoff level
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Consecutive fully-successful pages since the last penalty or recovery
    #[must_use]
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Multiplier the current level applies to every delay
    #[must_use]
    pub fn delay_multiplier(&self) -> f64 {
        self.backoff_factor.powi(self.level as i32)
    }

    /// Delay to apply before the next action, including jitter
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        jittered_delay(self.base_delay * self.delay_multiplier(), self.jitter)
    }

    /// Sleep for the current delay
    pub async fn pace(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    /// Raise the level after a timeout, network error, or collector failure
    pub fn apply_penalty(&mut self) {
        if self.level < self.max_level {
            self.level += 1;
            warn!(
                "rate penalty: level {}/{}, base delay now {:.2}s",
                self.level,
                self.max_level,
                self.base_delay * self.delay_multiplier()
            );
        } else {
            warn!("rate penalty at max level {}", self.max_level);
        }
        self.consecutive_successes = 0;
    }

    /// Record one fully harvested page; may earn a level back
    pub fn record_success(&mut self) {
        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.credit_recovery_pages {
            if self.level > 0 {
                self.level -= 1;
                info!(
                    "rate credit recovery: level {}/{}",
                    self.level, self.max_level
                );
            }
            self.consecutive_successes = 0;
        }
    }

    /// Restore the level from a checkpoint
    pub fn set_level(&mut self, level: u32) {
        self.level = level.min(self.max_level);
        if self.level > 0 {
            info!("rate level restored from checkpoint: {}", self.level);
        }
    }

    /// Restore the success counter from a checkpoint
    pub fn set_consecutive_successes(&mut self, count: u32) {
        self.consecutive_successes = count;
    }

    pub fn reset(&mut self) {
        self.level = 0;
        self.consecutive_successes = 0;
    }

    #[must_use]
    pub fn is_slowed(&self) -> bool {
        self.level > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorConfig;

    fn controller() -> AdaptiveRateController {
        let config = CollectorConfig {
            action_delay_base: 1.0,
            action_delay_random: 0.0,
            backoff_factor: 2.0,
            max_backoff_level: 3,
            credit_recovery_pages: 2,
            ..CollectorConfig::default()
        };
        AdaptiveRateController::new(&config)
    }

    #[test]
    fn test_penalty_raises_and_clamps() {
        let mut rc = controller();
        for _ in 0..5 {
            rc.apply_penalty();
        }
        assert_eq!(rc.level(), 3);
        assert!((rc.delay_multiplier() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_penalty_resets_success_counter() {
        let mut rc = controller();
        rc.record_success();
        assert_eq!(rc.consecutive_successes(), 1);
        rc.apply_penalty();
        assert_eq!(rc.consecutive_successes(), 0);
    }

    #[test]
    fn test_credit_recovery_round_trip() {
        let mut rc = controller();
        let before = rc.level();
        rc.apply_penalty();
        assert_eq!(rc.level(), before + 1);
        // credit_recovery_pages successes return to the pre-penalty level
        rc.record_success();
        rc.record_success();
        assert_eq!(rc.level(), before);
        assert_eq!(rc.consecutive_successes(), 0);
    }

    #[test]
    fn test_recovery_at_level_zero_only_resets_counter() {
        let mut rc = controller();
        rc.record_success();
        rc.record_success();
        assert_eq!(rc.level(), 0);
        assert_eq!(rc.consecutive_successes(), 0);
    }

    #[test]
    fn test_set_level_clamped() {
        let mut rc = controller();
        rc.set_level(10);
        assert_eq!(rc.level(), 3);
    }

    #[test]
    fn test_delay_scales_with_level() {
        let mut rc = controller();
        assert_eq!(rc.next_delay(), Duration::from_secs_f64(1.0));
        rc.apply_penalty();
        assert_eq!(rc.next_delay(), Duration::from_secs_f64(2.0));
    }
}
