//! Property-based tests for the pure lifecycle rules.

use proptest::prelude::*;

use run_control::run::{merge, plan_transition, Lifecycle, TransitionPlan};
use run_control::{RunError, Status};

fn status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

fn observed() -> impl Strategy<Value = Option<Status>> {
    prop::option::of(status())
}

proptest! {
    #[test]
    fn requesting_the_current_status_is_a_noop(intended in status(), observed in observed()) {
        let current = merge(intended, observed);
        let plan = plan_transition(intended, observed, current).unwrap();
        prop_assert_eq!(plan, TransitionPlan::NoOp(current));
        prop_assert!(!plan.needs_worker());
    }

    #[test]
    fn permitted_plans_reach_the_request_or_finished(
        intended in status(),
        observed in observed(),
        requested in status(),
    ) {
        if let Ok(plan) = plan_transition(intended, observed, requested) {
            let downgraded = observed == Some(Status::Finished)
                && plan == TransitionPlan::NoOp(Status::Finished);
            prop_assert!(plan.target() == requested || downgraded);
        }
    }

    #[test]
    fn stopped_never_finishes_directly(intended in status(), observed in observed()) {
        prop_assume!(merge(intended, observed) == Status::Stopped);
        let result = plan_transition(intended, observed, Status::Finished);
        let is_illegal = matches!(result, Err(RunError::IllegalTransition { .. }));
        prop_assert!(is_illegal);
    }

    #[test]
    fn initialized_never_stops(intended in status(), observed in observed()) {
        prop_assume!(merge(intended, observed) == Status::Initialized);
        prop_assert!(plan_transition(intended, observed, Status::Stopped).is_err());
    }

    #[test]
    fn worker_completion_always_wins(intended in status(), requested in status()) {
        prop_assert_eq!(merge(intended, Some(Status::Finished)), Status::Finished);
        let plan = plan_transition(intended, Some(Status::Finished), requested);
        match requested {
            Status::Operating | Status::Stopped | Status::Finished => {
                prop_assert_eq!(plan.unwrap(), TransitionPlan::NoOp(Status::Finished));
            }
            Status::Initialized => prop_assert!(plan.is_err()),
        }
    }

    #[test]
    fn settled_status_is_what_callers_see(
        start in status(),
        seen in observed(),
        requested in status(),
    ) {
        let mut lifecycle = Lifecycle { intended: start, observed: seen };
        if let Ok(plan) = lifecycle.plan(requested) {
            lifecycle.settle(plan.target());
            prop_assert_eq!(lifecycle.effective(), plan.target());
        }
    }
}
