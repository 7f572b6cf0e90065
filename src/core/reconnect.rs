use std::time::Duration;

/// How many times a failed connect attempt may be repeated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryBudget {
    /// Fail on the first retryable error.
    None,
    /// At most `n` retries after the first attempt.
    Limited(u32),
    /// Retry until cancelled. Requires a cancellation token.
    Unlimited,
}

impl RetryBudget {
    #[inline]
    pub fn is_unlimited(self) -> bool {
        matches!(self, RetryBudget::Unlimited)
    }
}

/// Integer convention: `0` = no retry, `n > 0` = at most `n` retries, negative = unlimited.
impl From<i32> for RetryBudget {
    fn from(retries: i32) -> Self {
        match retries {
            0 => RetryBudget::None,
            n if n < 0 => RetryBudget::Unlimited,
            n => RetryBudget::Limited(n.unsigned_abs()),
        }
    }
}

/// Fixed-delay retry schedule bounded by a [`RetryBudget`].
#[derive(Clone, Debug)]
pub struct FixedDelayRetry {
    delay: Duration,
    budget: RetryBudget,
    retries: u32,
}

impl FixedDelayRetry {
    pub fn new(delay: Duration, budget: RetryBudget) -> Self {
        Self {
            delay,
            budget,
            retries: 0,
        }
    }

    /// Consume one retry. `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let allowed = match self.budget {
            RetryBudget::None => false,
            RetryBudget::Limited(max) => self.retries < max,
            RetryBudget::Unlimited => true,
        };
        if !allowed {
            return None;
        }
        self.retries = self.retries.saturating_add(1);
        Some(self.delay)
    }

    /// Retries consumed so far.
    #[inline]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}
