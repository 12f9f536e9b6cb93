//! Jittered backoff for deferring work after transient contention.

use rand::Rng;
use std::time::Duration;

/// Returns `base` perturbed by up to ±25%, so that many workers contending
/// on the same row don't retry in lockstep.
pub fn jittered_backoff(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.75..=1.25);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jittered_backoff(base);
            assert!(jittered >= Duration::from_secs_f64(7.5));
            assert!(jittered <= Duration::from_secs_f64(12.5));
        }
    }
}
