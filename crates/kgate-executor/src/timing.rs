//! Pacing of rollouts and cluster commands

use std::time::Duration;

/// Every delay and timeout the executor observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPolicy {
    /// Monitoring delay after the first stage of a multi-stage rollout
    pub first_stage_delay: Duration,
    /// Delay after stages in the first half
    pub middle_stage_delay: Duration,
    /// Delay after later stages
    pub late_stage_delay: Duration,
    /// Wait between applying a stage and validating it
    pub settle_delay: Duration,
    /// Upper bound on one cluster command
    pub command_timeout: Duration,
    /// Backoff before the first retry; doubles per attempt
    pub retry_backoff: Duration,
}

impl TimingPolicy {
    /// No waiting at all
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            first_stage_delay: Duration::ZERO,
            middle_stage_delay: Duration::ZERO,
            late_stage_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            command_timeout: Duration::from_secs(30),
            retry_backoff: Duration::ZERO,
        }
    }

    /// Short delays for simulations against the mock cluster
    #[must_use]
    pub const fn mock() -> Self {
        Self {
            first_stage_delay: Duration::from_millis(100),
            middle_stage_delay: Duration::from_millis(50),
            late_stage_delay: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
            command_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
        }
    }

    /// Delays for real clusters
    #[must_use]
    pub const fn production() -> Self {
        Self {
            first_stage_delay: Duration::from_secs(60),
            middle_stage_delay: Duration::from_secs(30),
            late_stage_delay: Duration::from_secs(10),
            settle_delay: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(2),
        }
    }

    /// Monitoring delay after stage `index` (zero-based) of `total`.
    ///
    /// Nothing follows the last stage. The first stage is the canary and
    /// gets the longest watch; the first half gets the middle delay.
    #[must_use]
    pub fn delay_after(&self, index: usize, total: usize) -> Duration {
        let position = index + 1;
        if total <= 1 || position >= total {
            Duration::ZERO
        } else if position == 1 {
            self.first_stage_delay
        } else if position <= total / 2 {
            self.middle_stage_delay
        } else {
            self.late_stage_delay
        }
    }

    /// Backoff before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::production()
    }
}
