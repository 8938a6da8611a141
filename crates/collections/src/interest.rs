//! Interest accrual strategy.
//!
//! The legacy system carried an interest column but was never observed to
//! accrue a non-zero amount. Accrual is therefore a pluggable strategy with
//! a no-op default rather than an invented rate; totals always recompute
//! with whatever the strategy returns.

use time::OffsetDateTime;

/// Computes the interest owed on a case's outstanding principal.
pub trait InterestStrategy: Send + Sync {
    /// Interest in minor units for the given principal and case age.
    fn accrued_cents(&self, principal_cents: i64, opened_at: OffsetDateTime) -> i64;
}

/// Default strategy: no interest is ever charged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterest;

impl InterestStrategy for NoInterest {
    fn accrued_cents(&self, _principal_cents: i64, _opened_at: OffsetDateTime) -> i64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_interest_is_always_zero() {
        let strategy = NoInterest;
        let opened = OffsetDateTime::now_utc() - time::Duration::days(365);
        assert_eq!(strategy.accrued_cents(10_000, opened), 0);
        assert_eq!(strategy.accrued_cents(0, opened), 0);
    }
}
