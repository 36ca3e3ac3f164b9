//! Properties of the blocking rule at the gate boundary

use kgate_core::safety::{TokenRejection, WarningCode};
use kgate_core::{ApplyRequest, GateError, TokenId};
use kgate_test_utils::{cpu_change, setup_test_gate};
use proptest::prelude::*;
use tokio_test::block_on;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn increases_over_limit_never_reach_cluster(
        percent in 501u64..5_000,
        namespace in prop::sample::select(vec!["production", "staging", "dev"]),
    ) {
        let changes = vec![cpu_change(namespace, "api", percent)];
        let t = setup_test_gate(&changes);
        let err = block_on(t.gate.apply(ApplyRequest::new(changes.clone()).with_token(TokenId::new())))
            .unwrap_err();
        let is_violation = matches!(err, GateError::SafetyViolation { .. });
        prop_assert!(is_violation);
        prop_assert!(t.cluster.patches().is_empty());
        prop_assert!(t.gate.request_confirmation(&changes).is_err());
    }

    #[test]
    fn increases_within_limit_only_need_a_token(percent in 1u64..=500) {
        let changes = vec![cpu_change("staging", "api", percent)];
        let t = setup_test_gate(&changes);
        let assessment = t.gate.assess(&changes).unwrap();
        prop_assert!(!assessment.has_warning(WarningCode::ChangeLimitExceeded));

        let err = block_on(t.gate.apply(ApplyRequest::new(changes))).unwrap_err();
        let reason = match err {
            GateError::InvalidToken(e) => Some(e.reason),
            _ => None,
        };
        prop_assert_eq!(reason, Some(TokenRejection::Missing));
    }
}
