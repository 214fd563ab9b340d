//! Escalation policy for blocked steps.
//!
//! A blocked signal resolves deterministically, in this order:
//!
//! 1. the missing piece is the user's to give and fits in one question:
//!    ask the user
//! 2. the plan itself no longer holds: replan at the current step boundary,
//!    the whole remaining plan only when an earlier assumption broke
//! 3. anything else: fail with a terminal message
//!
//! Replans are budgeted per turn. Once the budget is spent, tier 2 degrades
//! to tier 3.

use tracing::{info, warn};
use turnkeep_core::action::{BlockedReason, BlockedSignal, SuggestedNext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanScope {
    /// Replace only the blocked step.
    CurrentStep,
    /// Replace the blocked step and everything after it.
    RemainingPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    AskUser(String),
    Replan(ReplanScope),
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    max_replans: usize,
    replans_used: usize,
}

impl EscalationPolicy {
    pub fn new(max_replans: usize) -> Self {
        Self {
            max_replans,
            replans_used: 0,
        }
    }

    pub fn replans_used(&self) -> usize {
        self.replans_used
    }

    /// Resolve a signal raised by the step at `step_index`.
    pub fn resolve(&mut self, signal: &BlockedSignal, step_index: usize) -> Resolution {
        if let Some(question) = user_question(signal) {
            info!(reason = ?signal.reason_code, "Blocked step resolved by asking the user");
            return Resolution::AskUser(question);
        }

        let plan_broken = matches!(
            signal.reason_code,
            BlockedReason::PlanInvalid | BlockedReason::ToolFailure
        ) || signal.suggested_next == SuggestedNext::Replan;

        if plan_broken && signal.suggested_next != SuggestedNext::Fail {
            if self.replans_used < self.max_replans {
                self.replans_used += 1;
                let scope = if signal.invalidates_earlier && step_index > 0 {
                    ReplanScope::RemainingPlan
                } else {
                    ReplanScope::CurrentStep
                };
                info!(
                    reason = ?signal.reason_code,
                    ?scope,
                    replans_used = self.replans_used,
                    "Replanning after blocked step"
                );
                return Resolution::Replan(scope);
            }
            warn!(
                max_replans = self.max_replans,
                "Replan budget exhausted, failing the turn"
            );
        }

        Resolution::Fail(apology(&signal.details))
    }
}

/// The single question to put to the user, if the block is theirs to lift.
fn user_question(signal: &BlockedSignal) -> Option<String> {
    let question = signal
        .question
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty());

    match (signal.reason_code, signal.suggested_next) {
        (_, SuggestedNext::AskUser) => question
            .map(str::to_string)
            .or_else(|| (!signal.details.trim().is_empty()).then(|| signal.details.clone())),
        (BlockedReason::InsufficientInfo, SuggestedNext::Replan) => question.map(str::to_string),
        _ => None,
    }
}

/// Terminal message for a turn that cannot finish.
pub(crate) fn apology(detail: &str) -> String {
    let detail = detail.trim();
    if detail.is_empty() {
        "I'm sorry, I couldn't finish that request.".into()
    } else {
        format!("I'm sorry, I couldn't finish that request: {detail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(reason: BlockedReason, next: SuggestedNext) -> BlockedSignal {
        BlockedSignal::new(reason, "details here", next)
    }

    #[test]
    fn user_owned_gap_asks() {
        let mut policy = EscalationPolicy::new(2);
        let mut s = signal(BlockedReason::InsufficientInfo, SuggestedNext::AskUser);
        s.question = Some("How many servings?".into());
        assert_eq!(
            policy.resolve(&s, 0),
            Resolution::AskUser("How many servings?".into())
        );
        assert_eq!(policy.replans_used(), 0);
    }

    #[test]
    fn tool_failure_replans_current_step_then_fails() {
        let mut policy = EscalationPolicy::new(1);
        let s = signal(BlockedReason::ToolFailure, SuggestedNext::Replan);
        assert_eq!(
            policy.resolve(&s, 1),
            Resolution::Replan(ReplanScope::CurrentStep)
        );
        assert!(matches!(policy.resolve(&s, 1), Resolution::Fail(_)));
    }

    #[test]
    fn broken_earlier_assumption_replans_remaining_plan() {
        let mut policy = EscalationPolicy::new(2);
        let mut s = signal(BlockedReason::PlanInvalid, SuggestedNext::Replan);
        s.invalidates_earlier = true;
        assert_eq!(
            policy.resolve(&s, 2),
            Resolution::Replan(ReplanScope::RemainingPlan)
        );
        // The first step has nothing earlier to invalidate
        assert_eq!(
            policy.resolve(&s, 0),
            Resolution::Replan(ReplanScope::CurrentStep)
        );
    }

    #[test]
    fn explicit_fail_is_terminal() {
        let mut policy = EscalationPolicy::new(2);
        let s = signal(BlockedReason::ToolFailure, SuggestedNext::Fail);
        match policy.resolve(&s, 0) {
            Resolution::Fail(message) => assert!(message.contains("details here")),
            other => panic!("expected fail, got {other:?}"),
        }
    }

    #[test]
    fn insufficient_info_without_question_fails() {
        let mut policy = EscalationPolicy::new(2);
        let s = signal(BlockedReason::InsufficientInfo, SuggestedNext::Fail);
        assert!(matches!(policy.resolve(&s, 0), Resolution::Fail(_)));
    }
}
