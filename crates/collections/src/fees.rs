//! Dunning fee schedule.
//!
//! Pure, table-driven mapping from an escalation level to the late fee and
//! payment deadline applied at that level. Values can be overridden per
//! deployment so jurisdictions with different statutory fees don't require
//! code changes.

use serde::Serialize;

/// Fee and deadline applied when a case escalates to a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeStep {
    /// Late fee in minor currency units (cents).
    pub late_fee_cents: i64,
    /// Days until the next automatic action once the notice is out.
    pub deadline_days: i64,
}

/// Table of fee steps for escalation levels 1 through 3.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    steps: [FeeStep; 3],
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            steps: [
                FeeStep { late_fee_cents: 500, deadline_days: 14 },
                FeeStep { late_fee_cents: 1500, deadline_days: 14 },
                FeeStep { late_fee_cents: 3000, deadline_days: 14 },
            ],
        }
    }
}

impl FeeSchedule {
    /// Build the schedule from env overrides, falling back to defaults.
    ///
    /// `DUNNING_FEE_LEVEL1_CENTS` .. `DUNNING_FEE_LEVEL3_CENTS` override the
    /// fees; `DUNNING_DEADLINE_DAYS` overrides the deadline for all levels.
    pub fn from_env() -> Self {
        let mut schedule = Self::default();

        for (idx, var) in [
            "DUNNING_FEE_LEVEL1_CENTS",
            "DUNNING_FEE_LEVEL2_CENTS",
            "DUNNING_FEE_LEVEL3_CENTS",
        ]
        .iter()
        .enumerate()
        {
            if let Some(cents) = std::env::var(var).ok().and_then(|v| v.parse::<i64>().ok()) {
                schedule.steps[idx].late_fee_cents = cents;
            }
        }

        if let Some(days) = std::env::var("DUNNING_DEADLINE_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
        {
            for step in &mut schedule.steps {
                step.deadline_days = days;
            }
        }

        schedule
    }

    /// Fee step for an escalation level.
    ///
    /// Returns `None` outside 1..=3; the state machine rejects such levels
    /// before they reach the schedule.
    pub fn fee_for(&self, level: i16) -> Option<FeeStep> {
        match level {
            1..=3 => Some(self.steps[(level - 1) as usize]),
            _ => None,
        }
    }

    /// Sum of fees applied by the time a case has reached `level`.
    pub fn accumulated_fees(&self, level: i16) -> i64 {
        (1..=level.min(3))
            .filter_map(|l| self.fee_for(l))
            .map(|s| s.late_fee_cents)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_values() {
        let schedule = FeeSchedule::default();
        assert_eq!(
            schedule.fee_for(1),
            Some(FeeStep { late_fee_cents: 500, deadline_days: 14 })
        );
        assert_eq!(
            schedule.fee_for(2),
            Some(FeeStep { late_fee_cents: 1500, deadline_days: 14 })
        );
        assert_eq!(
            schedule.fee_for(3),
            Some(FeeStep { late_fee_cents: 3000, deadline_days: 14 })
        );
    }

    #[test]
    fn test_out_of_range_levels_have_no_step() {
        let schedule = FeeSchedule::default();
        assert_eq!(schedule.fee_for(0), None);
        assert_eq!(schedule.fee_for(4), None);
        assert_eq!(schedule.fee_for(-1), None);
    }

    #[test]
    fn test_accumulated_fees_match_escalation_scenario() {
        // Level 1 -> 500, level 2 -> 500 + 1500, level 3 -> 500 + 1500 + 3000
        let schedule = FeeSchedule::default();
        assert_eq!(schedule.accumulated_fees(0), 0);
        assert_eq!(schedule.accumulated_fees(1), 500);
        assert_eq!(schedule.accumulated_fees(2), 2000);
        assert_eq!(schedule.accumulated_fees(3), 5000);
    }
}
