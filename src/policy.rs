//! Retry or escalate a failing card.

/// Where a failed card goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Back to the source column, picked up again on a later poll.
    Retry,
    /// Into the failed column, out of the automatic loop.
    Escalate,
}

/// Decides the fate of a card after its `attempts`-th consecutive failure.
///
/// Without a failed column there is nowhere to escalate to, so the card is
/// retried forever.
pub fn escalate(attempts: u32, max_attempts: u32, has_failed_column: bool) -> Escalation {
    if has_failed_column && attempts >= max_attempts {
        Escalation::Escalate
    } else {
        Escalation::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_failed_column_always_retries() {
        for attempts in [0, 1, 3, 10, u32::MAX] {
            for max in [0, 1, 3, u32::MAX] {
                assert_eq!(escalate(attempts, max, false), Escalation::Retry);
            }
        }
    }

    #[test]
    fn with_failed_column_escalates_at_max() {
        for attempts in 0..10u32 {
            for max in 0..10u32 {
                let expected = if attempts >= max {
                    Escalation::Escalate
                } else {
                    Escalation::Retry
                };
                assert_eq!(escalate(attempts, max, true), expected, "{} / {}", attempts, max);
            }
        }
    }

    #[test]
    fn default_budget() {
        assert_eq!(escalate(2, 3, true), Escalation::Retry);
        assert_eq!(escalate(3, 3, true), Escalation::Escalate);
    }
}
