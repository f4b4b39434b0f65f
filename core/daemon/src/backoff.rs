use std::cmp;
use std::time::Duration;

/// Linear backoff for consecutive reader faults: `step * faults`, capped at
/// `max`. A successful read resets it.
#[derive(Debug, Clone)]
pub struct FaultBackoff {
    step: Duration,
    max: Duration,
    consecutive: u32,
}

impl FaultBackoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max: cmp::max(step, max),
            consecutive: 0,
        }
    }

    /// Records a fault and returns how long to wait before the next read.
    pub fn on_fault(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        compute_backoff(self.step, self.max, self.consecutive)
    }

    pub fn on_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive
    }
}

fn compute_backoff(step: Duration, max: Duration, faults: u32) -> Duration {
    cmp::min(step.saturating_mul(faults), max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_linearly_until_cap() {
        let mut backoff = FaultBackoff::new(Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(backoff.on_fault(), Duration::from_secs(1));
        assert_eq!(backoff.on_fault(), Duration::from_secs(2));
        assert_eq!(backoff.on_fault(), Duration::from_secs(3));
        assert_eq!(backoff.on_fault(), Duration::from_secs(3));
        assert_eq!(backoff.consecutive_faults(), 4);
    }

    #[test]
    fn success_resets() {
        let mut backoff = FaultBackoff::new(Duration::from_millis(500), Duration::from_secs(10));
        backoff.on_fault();
        backoff.on_fault();
        backoff.on_success();
        assert_eq!(backoff.on_fault(), Duration::from_millis(500));
    }

    #[test]
    fn max_below_step_is_raised() {
        let mut backoff = FaultBackoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.on_fault(), Duration::from_secs(2));
    }
}
