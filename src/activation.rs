use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use tracing::trace;

/// Paces activations so that a large database does not open hundreds of links at
/// the same instant.
///
/// Callers share one queue of activation slots, so startup is serialized: each
/// slot starts at least `spacing` after the previous one, plus the fixed
/// `extra_delay`.
#[derive(Debug)]
pub struct ActivationTimer {
    spacing: Duration,
    extra_delay: Duration,
    last_activation: Mutex<Option<Instant>>,
}

impl ActivationTimer {
    pub fn new(spacing: Duration, extra_delay: Duration) -> Self {
        Self {
            spacing,
            extra_delay,
            last_activation: Mutex::new(None),
        }
    }

    /// Block until the next activation is allowed
    ///
    /// Returns how long the caller was held.
    pub fn check_and_delay(&self) -> Duration {
        let wait = self.reserve();
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        trace!("Activation gate held caller for {wait:?}");
        wait
    }

    /// Claim the next activation slot without waiting for it
    ///
    /// Returns how long from now the slot starts. Slots are handed out in call
    /// order, each at least `spacing` after the previous one.
    pub fn reserve(&self) -> Duration {
        let mut last = self.last_activation.lock().unwrap();
        let now = Instant::now();
        let spaced = match *last {
            Some(previous) => (previous + self.spacing).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        let wait = spaced + self.extra_delay;
        *last = Some(now + wait);
        wait
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn enforces_minimum_spacing() {
        let timer = ActivationTimer::new(Duration::from_millis(20), Duration::ZERO);
        let start = Instant::now();
        for _ in 0..4 {
            timer.check_and_delay();
        }
        // The first call is free, the next three are spaced
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn spacing_is_shared_between_threads() {
        let timer = Arc::new(ActivationTimer::new(
            Duration::from_millis(15),
            Duration::ZERO,
        ));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = timer.clone();
                thread::spawn(move || {
                    t.check_and_delay();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn reserved_slots_are_spaced() {
        let timer = ActivationTimer::new(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(timer.reserve(), Duration::ZERO);
        let second = timer.reserve();
        let third = timer.reserve();
        assert!(second > Duration::from_millis(50) && second <= Duration::from_millis(100));
        assert!(third > Duration::from_millis(150));
    }

    #[test]
    fn no_spacing_means_no_wait() {
        let timer = ActivationTimer::new(Duration::ZERO, Duration::ZERO);
        assert!(timer.check_and_delay() < Duration::from_millis(50));
        assert!(timer.check_and_delay() < Duration::from_millis(50));
    }
}
