// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Policy
//!
//! The single decision table for settling a delivery:
//!
//! | outcome                            | attempts          | decision  |
//! |------------------------------------|-------------------|-----------|
//! | success                            | any               | `Ack`     |
//! | permanent failure                  | any               | `Reject`  |
//! | transient / poison / unknown       | `< max_attempts`  | `Requeue` |
//! | transient / poison / unknown       | `>= max_attempts` | `Reject`  |
//!
//! Every `Reject` is terminal and goes to the dead-letter sink.

use crate::outcome::{AckDecision, FailureKind, Outcome};

/// Retry ceiling used when none is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Decides how to settle a delivery given its outcome and the attempt count
/// recorded for its correlation key.
pub fn decide(outcome: &Outcome, attempts: u32, max_attempts: u32) -> AckDecision {
    match outcome {
        Outcome::Success => AckDecision::Ack,
        Outcome::Failure {
            kind: FailureKind::Permanent,
            ..
        } => AckDecision::Reject,
        Outcome::Failure { .. } if attempts < max_attempts => AckDecision::Requeue,
        Outcome::Failure { .. } => AckDecision::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = DEFAULT_MAX_ATTEMPTS;

    fn failure(kind: FailureKind) -> Outcome {
        Outcome::failure(kind, "boom")
    }

    #[test]
    fn success_is_always_acked() {
        for attempts in [1, MAX, MAX + 10] {
            assert_eq!(decide(&Outcome::Success, attempts, MAX), AckDecision::Ack);
        }
    }

    #[test]
    fn permanent_is_rejected_regardless_of_attempts() {
        let outcome = failure(FailureKind::Permanent);

        assert_eq!(decide(&outcome, 1, MAX), AckDecision::Reject);
        assert_eq!(decide(&outcome, MAX + 5, MAX), AckDecision::Reject);
    }

    #[test]
    fn retryable_kinds_requeue_below_ceiling() {
        for kind in [FailureKind::Transient, FailureKind::Poison, FailureKind::Unknown] {
            for attempts in 1..MAX {
                assert_eq!(
                    decide(&failure(kind), attempts, MAX),
                    AckDecision::Requeue,
                    "{kind} at attempt {attempts}"
                );
            }
        }
    }

    #[test]
    fn retryable_kinds_reject_at_or_above_ceiling() {
        for kind in [FailureKind::Transient, FailureKind::Poison, FailureKind::Unknown] {
            assert_eq!(decide(&failure(kind), MAX, MAX), AckDecision::Reject);
            assert_eq!(decide(&failure(kind), MAX + 1, MAX), AckDecision::Reject);
        }
    }

    #[test]
    fn single_attempt_budget_never_requeues() {
        assert_eq!(decide(&failure(FailureKind::Transient), 1, 1), AckDecision::Reject);
    }
}
