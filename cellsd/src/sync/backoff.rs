use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;

/// Poll delays in seconds. Non-decreasing; the last entry repeats.
const DEFAULT_TICKER_SCHEDULE: [u64; 11] = [2, 2, 2, 3, 3, 5, 5, 10, 10, 30, 60];

/// Increasing delay generator for the foreground poll loop. Shared between the
/// loop and whoever resets it, hence the atomic cursor.
#[derive(Debug)]
pub struct BackOffTicker {
    schedule: Vec<Duration>,
    index: AtomicUsize,
}

impl BackOffTicker {
    pub fn new() -> Self {
        Self::with_schedule(
            DEFAULT_TICKER_SCHEDULE
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
        )
    }

    /// An unsorted schedule is sorted so delays never shrink between resets.
    pub fn with_schedule(mut schedule: Vec<Duration>) -> Self {
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(1));
        }
        schedule.sort();
        Self {
            schedule,
            index: AtomicUsize::new(0),
        }
    }

    pub fn next_delay(&self) -> Duration {
        let last = self.schedule.len() - 1;
        let current = self
            .index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1).min(last)))
            .unwrap_or(last);
        self.schedule[current.min(last)]
    }

    pub fn reset_index(&self) {
        self.index.store(0, Ordering::SeqCst);
    }

    pub fn current_index(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }
}

impl Default for BackOffTicker {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential retry delay for transfers.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn ticker_is_non_decreasing_until_reset() {
        let ticker = BackOffTicker::new();
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = ticker.next_delay();
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));

        ticker.reset_index();
        assert_eq!(ticker.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn custom_schedule_is_sorted() {
        let ticker = BackOffTicker::with_schedule(vec![
            Duration::from_millis(30),
            Duration::from_millis(10),
        ]);
        assert_eq!(ticker.next_delay(), Duration::from_millis(10));
        assert_eq!(ticker.next_delay(), Duration::from_millis(30));
        assert_eq!(ticker.next_delay(), Duration::from_millis(30));
        assert_eq!(ticker.current_index(), 1);
    }

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_with_rng(0, &mut rng),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_with_rng(2, &mut rng),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff.delay_with_rng(5, &mut rng),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn backoff_with_jitter_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        assert!(backoff.delay_with_rng(3, &mut rng) <= Duration::from_millis(800));
    }
}
