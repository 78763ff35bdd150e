//! # Release-delay decay for failed jobs.
//!
//! A failed or timed-out job goes back to the queue with a longer delay than
//! it was last put or released with. [`Decay`] multiplies the previous delay
//! (floored at one second) by [`Decay::factor`] and rounds up. Once the result
//! passes [`Decay::ceiling`] the job is buried instead.
//!
//! # Example
//! ```rust
//! use juggler::policy::{Backoff, Decay, Decision};
//!
//! let decay = Decay::default();
//!
//! // A fresh job (delay 0) is retried after 2s.
//! assert_eq!(decay.next(0), Decision::Release { delay: 2 });
//!
//! // 2s → 3s → 4s → 6s ...
//! assert_eq!(decay.next(2), Decision::Release { delay: 3 });
//!
//! // Past a day, give up.
//! assert_eq!(decay.next(86_400), Decision::Bury);
//! ```

/// What to do with a job that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Return to the queue, reservable again after `delay` seconds.
    Release { delay: u32 },
    /// Set aside for manual inspection.
    Bury,
}

/// Maps a job's previous release delay to its next disposition.
pub trait Backoff: Send + Sync + 'static {
    fn next(&self, previous_delay: u32) -> Decision;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Decision + Send + Sync + 'static,
{
    fn next(&self, previous_delay: u32) -> Decision {
        self(previous_delay)
    }
}

/// Exponential decay with a burial ceiling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decay {
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Largest delay, in seconds, a job is still released with.
    pub ceiling: u32,
}

impl Default for Decay {
    /// `factor = 1.3`, `ceiling = 86400` (one day).
    fn default() -> Self {
        Self {
            factor: 1.3,
            ceiling: 86_400,
        }
    }
}

impl Backoff for Decay {
    fn next(&self, previous_delay: u32) -> Decision {
        let base = f64::from(previous_delay.max(1));
        // Absorb float noise so exact products (10 × 1.3) do not round up.
        let next = (base * self.factor - 1e-9).ceil();

        if !next.is_finite() || next > f64::from(self.ceiling) {
            return Decision::Bury;
        }

        Decision::Release {
            delay: (next as u32).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_job_released_after_two_seconds() {
        assert_eq!(Decay::default().next(0), Decision::Release { delay: 2 });
        assert_eq!(Decay::default().next(1), Decision::Release { delay: 2 });
    }

    #[test]
    fn test_growth_sequence() {
        let decay = Decay::default();
        let mut delay = 0;
        let mut seen = Vec::new();
        for _ in 0..6 {
            match decay.next(delay) {
                Decision::Release { delay: d } => {
                    seen.push(d);
                    delay = d;
                }
                Decision::Bury => panic!("buried too early"),
            }
        }
        assert_eq!(seen, vec![2, 3, 4, 6, 8, 11]);
    }

    #[test]
    fn test_ceiling_boundary() {
        let decay = Decay::default();
        // 66461 × 1.3 = 86399.3 → 86400, still allowed.
        assert_eq!(decay.next(66_461), Decision::Release { delay: 86_400 });
        // 66462 × 1.3 = 86400.6 → 86401, over the ceiling.
        assert_eq!(decay.next(66_462), Decision::Bury);
        assert_eq!(decay.next(u32::MAX), Decision::Bury);
    }

    #[test]
    fn test_schedule_always_terminates_in_bury() {
        let decay = Decay::default();
        let mut delay = 0;
        let mut steps = 0;
        while let Decision::Release { delay: d } = decay.next(delay) {
            assert!(d > delay, "delay must strictly grow: {delay} -> {d}");
            delay = d;
            steps += 1;
            assert!(steps < 100, "decay never reached the ceiling");
        }
    }

    #[test]
    fn test_closure_backoff() {
        let always_bury = |_previous: u32| Decision::Bury;
        assert_eq!(Backoff::next(&always_bury, 5), Decision::Bury);
    }

    #[test]
    fn test_custom_factor() {
        let doubling = Decay {
            factor: 2.0,
            ceiling: 10,
        };
        assert_eq!(doubling.next(4), Decision::Release { delay: 8 });
        assert_eq!(doubling.next(8), Decision::Bury);
    }
}
