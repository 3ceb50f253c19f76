use std::time::Duration;

/// Decides how long to wait between consecutive attempts to rebuild a
/// connection (pool refills and the control connection alike).
///
/// A fresh [ReconnectionSchedule] is created per reconnection episode, so a
/// policy may keep per-episode state in the schedule while staying stateless
/// itself.
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync>;
}

/// A stream of delays for one reconnection episode.
pub trait ReconnectionSchedule {
    fn next_delay(&mut self) -> Duration;
}

/// Waits a constant time between attempts.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReconnectionPolicy {
    base_delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }
}

impl Default for ConstantReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync> {
        Box::new(ConstantReconnectionSchedule {
            base_delay: self.base_delay,
        })
    }
}

struct ConstantReconnectionSchedule {
    base_delay: Duration,
}

impl ReconnectionSchedule for ConstantReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        self.base_delay
    }
}

/// Doubles the delay on each attempt, up to a cap. The default policy,
/// starting at 1 second and capping at 10 minutes.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync> {
        Box::new(ExponentialReconnectionSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempt: 0,
        })
    }
}

struct ExponentialReconnectionSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectionSchedule for ExponentialReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .base_delay
            .checked_mul(1_u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if delay < self.max_delay {
            self.attempt += 1;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_until_cap() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(600),
        );
        let mut schedule = policy.new_schedule();
        let mut delays = Vec::new();
        for _ in 0..12 {
            delays.push(schedule.next_delay().as_secs());
        }
        assert_eq!(delays[..4], [1, 2, 4, 8]);
        assert_eq!(*delays.last().unwrap(), 600);
    }

    #[test]
    fn schedules_are_independent() {
        let policy = ExponentialReconnectionPolicy::default();
        let mut first = policy.new_schedule();
        first.next_delay();
        first.next_delay();
        let mut second = policy.new_schedule();
        assert_eq!(second.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(250));
        let mut schedule = policy.new_schedule();
        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }
}
