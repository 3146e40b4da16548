//! Randomised pacing between browser actions
//!
//! Every page interaction sleeps a base duration plus uniform jitter so the
//! request pattern does not look mechanical. The rate controller multiplies
//! the base by its backoff factor before this jitter is applied.

use std::time::Duration;

use rand::Rng;

/// Compute a delay of `base` seconds plus up to `jitter` seconds of noise
#[must_use]
pub fn jittered_delay(base_secs: f64, jitter_secs: f64) -> Duration {
    let base = base_secs.max(0.0);
    let jitter = if jitter_secs > 0.0 {
        rand::rng().random_range(0.0..jitter_secs)
    } else {
        0.0
    };
    Duration::from_secs_f64(base + jitter)
}

/// Sleep for a jittered interval
pub async fn sleep_jittered(base_secs: f64, jitter_secs: f64) {
    tokio::time::sleep(jittered_delay(base_secs, jitter_secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let d = jittered_delay(1.0, 0.5);
            assert!(d >= Duration::from_secs_f64(1.0));
            assert!(d < Duration::from_secs_f64(1.5));
        }
    }

    #[test]
    fn test_zero_jitter() {
        assert_eq!(jittered_delay(2.0, 0.0), Duration::from_secs_f64(2.0));
    }

    #[test]
    fn test_negative_base_clamped() {
        assert_eq!(jittered_delay(-1.0, 0.0), Duration::ZERO);
    }
}
