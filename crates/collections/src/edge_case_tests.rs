// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Recovery Engine
//!
//! Covers boundary conditions in:
//! - Fee schedule accumulation across escalation levels
//! - Escalation legality and deadline boundaries
//! - Conversion checklist and completeness math
//! - Export batch normalization
//! - Error taxonomy stability

#[cfg(test)]
mod fee_schedule_tests {
    use crate::fees::FeeSchedule;

    // A case opened with a 10000 cent principal walks the default schedule:
    // level 1 adds 500 (total 10500), level 2 adds 1500 (total 12000),
    // level 3 adds 3000 (total 15000).
    #[test]
    fn test_default_schedule_walkthrough() {
        let schedule = FeeSchedule::default();
        let principal = 10_000i64;

        let mut late_fees = 0i64;
        let mut totals = Vec::new();
        for level in 1..=3 {
            let step = schedule.fee_for(level).unwrap();
            late_fees += step.late_fee_cents;
            totals.push(principal + late_fees);
        }

        assert_eq!(totals, vec![10_500, 12_000, 15_000]);
    }

    #[test]
    fn test_accumulated_fees_per_level() {
        let schedule = FeeSchedule::default();
        assert_eq!(schedule.accumulated_fees(0), 0);
        assert_eq!(schedule.accumulated_fees(1), 500);
        assert_eq!(schedule.accumulated_fees(2), 2_000);
        assert_eq!(schedule.accumulated_fees(3), 5_000);
    }

    #[test]
    fn test_no_fee_outside_level_range() {
        let schedule = FeeSchedule::default();
        assert!(schedule.fee_for(0).is_none());
        assert!(schedule.fee_for(4).is_none());
        assert!(schedule.fee_for(-1).is_none());
    }

    #[test]
    fn test_zero_principal_case_still_accrues_fees() {
        let schedule = FeeSchedule::default();
        let principal = 0i64;
        let total_at_3 = principal + schedule.accumulated_fees(3);
        assert_eq!(total_at_3, 5_000);
    }
}

#[cfg(test)]
mod escalation_tests {
    use crate::dunning::{escalation_allowed, MAX_ESCALATION_LEVEL};
    use tessera_shared::DunningStatus;
    use time::{Duration, OffsetDateTime};

    #[test]
    fn test_level_cap_is_three() {
        assert_eq!(MAX_ESCALATION_LEVEL, 3);
    }

    // A deadline exactly at 'now' is due, one millisecond later is not.
    #[test]
    fn test_deadline_boundary() {
        let now = OffsetDateTime::now_utc();
        assert!(escalation_allowed(DunningStatus::Open, Some(now), now, false).is_ok());
        assert!(escalation_allowed(
            DunningStatus::Open,
            Some(now + Duration::milliseconds(1)),
            now,
            false
        )
        .is_err());
    }

    #[test]
    fn test_force_bypasses_deadline_but_not_terminal_state() {
        let now = OffsetDateTime::now_utc();
        let future = Some(now + Duration::days(14));

        assert!(escalation_allowed(DunningStatus::Open, future, now, true).is_ok());
        assert!(escalation_allowed(DunningStatus::Paid, future, now, true).is_err());
        assert!(escalation_allowed(DunningStatus::Cancelled, None, now, true).is_err());
    }

    // A case with no scheduled action (converted to collection) is out of
    // the scheduler's reach; only a forced operator action moves it.
    #[test]
    fn test_case_without_deadline_needs_force() {
        let now = OffsetDateTime::now_utc();
        assert!(escalation_allowed(DunningStatus::Open, None, now, false).is_err());
        assert!(escalation_allowed(DunningStatus::Open, None, now, true).is_ok());
    }
}

#[cfg(test)]
mod conversion_tests {
    use crate::convert::{
        completeness_percentage, priority_for_amount, DebtorChecklist, REQUIRED_FIELDS,
    };
    use tessera_shared::CasePriority;
    use time::{Date, Month, OffsetDateTime};

    fn full_checklist() -> DebtorChecklist {
        DebtorChecklist {
            legal_name: Some("Grace Hopper".into()),
            address: Some("1 Navy Way".into()),
            date_of_birth: Date::from_calendar_date(1992, Month::December, 9).ok(),
            contact_email: Some("grace@example.com".into()),
            terms_accepted_at: Some(OffsetDateTime::now_utc()),
            subscription_reference: Some("sub_abc".into()),
            invoice_reference: Some("pi_def".into()),
            total_cents: 15_000,
        }
    }

    #[test]
    fn test_checklist_covers_all_eight_fields() {
        let empty = DebtorChecklist::default();
        let missing = empty.missing_fields();
        assert_eq!(missing.len(), REQUIRED_FIELDS.len());
        for field in REQUIRED_FIELDS {
            assert!(missing.contains(&field.to_string()), "missing {field}");
        }
        assert_eq!(completeness_percentage(missing.len()), 0);
    }

    #[test]
    fn test_all_present_is_100_percent() {
        assert!(full_checklist().missing_fields().is_empty());
        assert_eq!(completeness_percentage(0), 100);
    }

    // 1 of 8 missing rounds to 88, not 87.5 truncated.
    #[test]
    fn test_percentage_rounds_half_up() {
        assert_eq!(completeness_percentage(1), 88);
        assert_eq!(completeness_percentage(3), 63);
        assert_eq!(completeness_percentage(5), 38);
    }

    #[test]
    fn test_priority_boundaries_are_inclusive() {
        assert_eq!(priority_for_amount(14_999), CasePriority::Low);
        assert_eq!(priority_for_amount(15_000), CasePriority::Normal);
        assert_eq!(priority_for_amount(49_999), CasePriority::Normal);
        assert_eq!(priority_for_amount(50_000), CasePriority::High);
        assert_eq!(priority_for_amount(99_999), CasePriority::High);
        assert_eq!(priority_for_amount(100_000), CasePriority::Urgent);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CasePriority::Urgent > CasePriority::High);
        assert!(CasePriority::High > CasePriority::Normal);
        assert!(CasePriority::Normal > CasePriority::Low);
    }
}

#[cfg(test)]
mod export_tests {
    use crate::export::normalize_case_ids;
    use uuid::Uuid;

    #[test]
    fn test_many_duplicates_collapse_to_one() {
        let id = Uuid::new_v4();
        assert_eq!(normalize_case_ids(&vec![id; 50]), vec![id]);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        let once = normalize_case_ids(&ids);
        let twice = normalize_case_ids(&once);
        assert_eq!(once, twice);
    }
}

#[cfg(test)]
mod error_tests {
    use crate::error::CollectionsError;
    use uuid::Uuid;

    // Admin clients branch on these codes; renaming one is a breaking change.
    #[test]
    fn test_full_code_surface() {
        let cases: Vec<(CollectionsError, &str)> = vec![
            (
                CollectionsError::InvalidStateTransition {
                    state: "cancelled".into(),
                    action: "mark_paid".into(),
                },
                "invalid_state_transition",
            ),
            (
                CollectionsError::ConcurrentModification {
                    entity: "dunning_cases",
                    id: Uuid::new_v4(),
                },
                "concurrent_modification",
            ),
            (
                CollectionsError::AlreadyProcessed("evt_1".into()),
                "already_processed",
            ),
            (
                CollectionsError::IncompleteData {
                    missing: vec!["address".into()],
                },
                "incomplete_data",
            ),
            (
                CollectionsError::ExternalDependency("mail timeout".into()),
                "external_dependency_failure",
            ),
            (CollectionsError::CaseNotFound(Uuid::new_v4()), "not_found"),
            (
                CollectionsError::WebhookSignatureInvalid,
                "webhook_signature_invalid",
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.code(), expected);
        }
    }
}
