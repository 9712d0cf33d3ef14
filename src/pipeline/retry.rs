//! Retry decision after a failed processing attempt

/// What to do with a delivery whose processing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reject without requeue; the broker brings it back after the retry TTL
    Retry,
    /// Mark FAILED and park the payload in the failed queue
    GiveUp,
}

/// `GiveUp` iff `retry_count >= max_retries`.
pub fn decide(retry_count: i32, max_retries: i32) -> RetryDecision {
    if retry_count >= max_retries {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Retry
    }
}

/// Retry budget for one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, retry_count: i32) -> RetryDecision {
        decide(retry_count, self.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0), RetryDecision::Retry);
        assert_eq!(policy.decide(1), RetryDecision::Retry);
        assert_eq!(policy.decide(2), RetryDecision::Retry);
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_is_total() {
        for max in 0..6 {
            for count in 0..10 {
                let expected = if count >= max {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry
                };
                assert_eq!(decide(count, max), expected, "count={count} max={max}");
            }
        }
    }

    #[test]
    fn test_zero_budget_gives_up_immediately() {
        assert_eq!(RetryPolicy::new(0).decide(0), RetryDecision::GiveUp);
    }
}
