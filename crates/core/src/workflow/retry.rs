use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before the next attempt of a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryDelay {
    /// Same delay before every attempt
    Fixed { delay_ms: u64 },
    /// `delay_ms * attempt`
    Linear { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`, optionally capped
    Exponential {
        delay_ms: u64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },
}

impl RetryDelay {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self {
            RetryDelay::Fixed { delay_ms } => *delay_ms,
            RetryDelay::Linear { delay_ms } => delay_ms.saturating_mul(u64::from(attempt)),
            RetryDelay::Exponential {
                delay_ms,
                max_delay_ms,
            } => {
                let factor = 2_u64.checked_pow(attempt - 1).unwrap_or(u64::MAX);
                let delay = delay_ms.saturating_mul(factor);
                match max_delay_ms {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
        };
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let delay = RetryDelay::Fixed { delay_ms: 250 };
        assert_eq!(delay.delay_for(1), Duration::from_millis(250));
        assert_eq!(delay.delay_for(4), Duration::from_millis(250));
    }

    #[test]
    fn test_linear_delay() {
        let delay = RetryDelay::Linear { delay_ms: 100 };
        assert_eq!(delay.delay_for(1), Duration::from_millis(100));
        assert_eq!(delay.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_with_cap() {
        let delay = RetryDelay::Exponential {
            delay_ms: 100,
            max_delay_ms: Some(500),
        };
        assert_eq!(delay.delay_for(1), Duration::from_millis(100));
        assert_eq!(delay.delay_for(2), Duration::from_millis(200));
        assert_eq!(delay.delay_for(3), Duration::from_millis(400));
        assert_eq!(delay.delay_for(4), Duration::from_millis(500));
        // attempt 0 is treated as the first attempt
        assert_eq!(delay.delay_for(0), Duration::from_millis(100));
    }

    #[test]
    fn test_retry_delay_deserializes_from_tagged_json() {
        let delay: RetryDelay =
            serde_json::from_value(serde_json::json!({"strategy": "exponential", "delay_ms": 50}))
                .unwrap();
        assert_eq!(
            delay,
            RetryDelay::Exponential {
                delay_ms: 50,
                max_delay_ms: None
            }
        );
    }
}
