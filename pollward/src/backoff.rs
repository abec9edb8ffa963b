use rand::Rng;
use std::cmp;
use std::time::Duration;

/// Exponential backoff with jitter
///
/// Each delay is drawn from `[current / 2, current]`, then `current`
/// doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = cmp::max(initial, max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = cmp::min(self.current * 2, self.max);

        let half_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = if half_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half_ms)
        };
        base - Duration::from_millis(jitter_ms)
    }
}

#[test]
fn grows_and_caps() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));

    let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
    let bases = [1, 2, 4, 4, 4];
    for (delay, base) in delays.iter().zip(bases) {
        let base = Duration::from_secs(base);
        assert!(*delay <= base, "{delay:?} > {base:?}");
        assert!(base / 2 <= *delay, "{delay:?} < half of {base:?}");
    }

    backoff.reset();
    assert!(backoff.next_delay() <= Duration::from_secs(1));
}
