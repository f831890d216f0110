//! Canvass Stage - guarded stage transition engine.
//!
//! **CRITICAL INVARIANT**: this is the ONLY code that writes a volunteer's
//! stage fields. Every other component (ledger auto-promotion, approval
//! workflow, manual edits in the service facade) routes through
//! [`StageEngine::attempt_transition`].
//!
//! The engine never evaluates whether a transition is wise; it only enforces
//! who may apply it. The separate pure decision function
//! [`StageEngine::evaluate_auto_promotion`] answers the "wise" question for
//! the activity ledger and is independently forbidden from ever
//! recommending a gated stage.

#![deny(unsafe_code)]

use canvass_types::{CoreConfig, Stage, Volunteer};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Who is asking for the transition.
///
/// `Reviewed` marks the administrative path entitled to override a stage
/// lock; its `lock` flag is the only way `stage_locked` is ever set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionAuthority {
    /// Unreviewed caller (auto-promotion). Cannot override the lock and
    /// cannot reach a gated stage.
    Automatic,
    /// Reviewed/administrative caller.
    Reviewed { lock: bool },
}

impl TransitionAuthority {
    fn is_reviewed(&self) -> bool {
        matches!(self, TransitionAuthority::Reviewed { .. })
    }

    fn wants_lock(&self) -> bool {
        matches!(self, TransitionAuthority::Reviewed { lock: true })
    }
}

/// Why a well-formed transition was refused. Refusals are expected
/// outcomes the caller branches on, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// The volunteer's stage is locked and the caller is not reviewed.
    StageLocked,
    /// The target is a gated stage and the caller is not reviewed.
    GatedTarget,
}

impl RefusalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalReason::StageLocked => "stage is locked",
            RefusalReason::GatedTarget => "gated stages require an approved request",
        }
    }
}

/// Outcome of a transition attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Stage changed; time, reason, and (if requested) the lock were stamped.
    Applied { from: Stage, to: Stage },
    /// Target equalled the current stage and a reviewed caller newly set
    /// the lock; nothing else changed.
    LockApplied,
    /// Target equalled the current stage; nothing to do.
    Unchanged,
    /// Forbidden by domain rule; the volunteer is untouched.
    Refused { reason: RefusalReason },
}

impl TransitionOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Promotion thresholds, lifted out of [`CoreConfig`] so the decision
/// function stays pure and test cases can vary them directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PromotionThresholds {
    pub activate: u64,
    pub owner: u64,
}

impl From<&CoreConfig> for PromotionThresholds {
    fn from(config: &CoreConfig) -> Self {
        Self {
            activate: config.activate_threshold,
            owner: config.owner_threshold,
        }
    }
}

/// The single guarded mutation primitive for stage state.
#[derive(Clone, Copy, Debug, Default)]
pub struct StageEngine;

impl StageEngine {
    pub fn new() -> Self {
        Self
    }

    /// Attempt a stage transition on `volunteer`.
    ///
    /// Semantics:
    /// - same-stage target: no-op, unless a reviewed caller newly sets the
    ///   lock, in which case the lock is applied and nothing else changes;
    /// - locked volunteer + unreviewed caller: refused (logged, not raised);
    /// - gated target + unreviewed caller: refused;
    /// - otherwise the stage, change time, and reason are stamped, and the
    ///   lock is set only when the reviewed caller explicitly asked for it.
    pub fn attempt_transition(
        &self,
        volunteer: &mut Volunteer,
        target: Stage,
        reason: &str,
        authority: TransitionAuthority,
    ) -> TransitionOutcome {
        if volunteer.stage == target {
            if authority.wants_lock() && !volunteer.stage_locked {
                volunteer.stage_locked = true;
                info!(
                    volunteer = %volunteer.id,
                    stage = %volunteer.stage,
                    "Stage lock applied without stage change"
                );
                return TransitionOutcome::LockApplied;
            }
            debug!(
                volunteer = %volunteer.id,
                stage = %volunteer.stage,
                "Transition target equals current stage"
            );
            return TransitionOutcome::Unchanged;
        }

        if volunteer.stage_locked && !authority.is_reviewed() {
            warn!(
                volunteer = %volunteer.id,
                stage = %volunteer.stage,
                target = %target,
                reason,
                "Refusing stage change: stage is locked"
            );
            return TransitionOutcome::Refused {
                reason: RefusalReason::StageLocked,
            };
        }

        if target.is_gated() && !authority.is_reviewed() {
            warn!(
                volunteer = %volunteer.id,
                target = %target,
                reason,
                "Refusing stage change: gated target without review"
            );
            return TransitionOutcome::Refused {
                reason: RefusalReason::GatedTarget,
            };
        }

        let from = volunteer.stage;
        volunteer.stage = target;
        volunteer.stage_last_changed_at = Some(Utc::now());
        volunteer.stage_changed_reason = Some(reason.to_string());
        if authority.wants_lock() {
            volunteer.stage_locked = true;
        }

        info!(
            volunteer = %volunteer.id,
            from = %from,
            to = %target,
            reason,
            locked = volunteer.stage_locked,
            "Stage changed"
        );
        TransitionOutcome::Applied { from, to: target }
    }

    /// Decide whether a volunteer has earned an automatic promotion.
    ///
    /// Pure: reads the volunteer and the cumulative activity count, returns
    /// the next stage or `None`. A locked volunteer, or one already in a
    /// gated stage, never receives a recommendation; and by construction the
    /// recommendation is never a gated stage - that is a second independent
    /// guard against unreviewed escalation, on top of the authority check in
    /// [`Self::attempt_transition`].
    pub fn evaluate_auto_promotion(
        &self,
        volunteer: &Volunteer,
        activity_count: u64,
        thresholds: &PromotionThresholds,
    ) -> Option<Stage> {
        if volunteer.stage_locked || volunteer.stage.is_gated() {
            return None;
        }

        let next = match volunteer.stage {
            stage if stage.is_early_arc() && activity_count >= thresholds.activate => Stage::Active,
            Stage::Active if activity_count >= thresholds.owner => Stage::Owner,
            _ => return None,
        };

        debug_assert!(!next.is_gated());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> PromotionThresholds {
        PromotionThresholds {
            activate: 1,
            owner: 5,
        }
    }

    fn volunteer_at(stage: Stage, locked: bool) -> Volunteer {
        let mut v = Volunteer::new("track-1", "Ada");
        v.stage = stage;
        v.stage_locked = locked;
        v
    }

    #[test]
    fn automatic_transition_stamps_time_and_reason() {
        let engine = StageEngine::new();
        let mut v = volunteer_at(Stage::Newcomer, false);

        let outcome = engine.attempt_transition(
            &mut v,
            Stage::Active,
            "auto:newcomer->active",
            TransitionAuthority::Automatic,
        );

        assert_eq!(
            outcome,
            TransitionOutcome::Applied {
                from: Stage::Newcomer,
                to: Stage::Active
            }
        );
        assert_eq!(v.stage, Stage::Active);
        assert!(!v.stage_locked);
        assert!(v.stage_last_changed_at.is_some());
        assert_eq!(v.stage_changed_reason.as_deref(), Some("auto:newcomer->active"));
    }

    #[test]
    fn locked_volunteer_refuses_automatic_change() {
        let engine = StageEngine::new();
        let mut v = volunteer_at(Stage::Team, true);

        let outcome = engine.attempt_transition(
            &mut v,
            Stage::Owner,
            "auto:TEAM->owner",
            TransitionAuthority::Automatic,
        );

        assert_eq!(
            outcome,
            TransitionOutcome::Refused {
                reason: RefusalReason::StageLocked
            }
        );
        assert_eq!(v.stage, Stage::Team);
        assert!(v.stage_locked);
    }

    #[test]
    fn gated_target_refused_without_review() {
        let engine = StageEngine::new();
        let mut v = volunteer_at(Stage::Owner, false);

        let outcome = engine.attempt_transition(
            &mut v,
            Stage::Leader,
            "auto:owner->LEADER",
            TransitionAuthority::Automatic,
        );

        assert_eq!(
            outcome,
            TransitionOutcome::Refused {
                reason: RefusalReason::GatedTarget
            }
        );
        assert_eq!(v.stage, Stage::Owner);
    }

    #[test]
    fn reviewed_path_overrides_lock_and_locks_gated_stage() {
        let engine = StageEngine::new();
        let mut v = volunteer_at(Stage::Owner, true);

        let outcome = engine.attempt_transition(
            &mut v,
            Stage::Fundraising,
            "approved:fundraising_access",
            TransitionAuthority::Reviewed { lock: true },
        );

        assert!(outcome.was_applied());
        assert_eq!(v.stage, Stage::Fundraising);
        assert!(v.stage_locked);
    }

    #[test]
    fn same_stage_is_a_noop_unless_lock_newly_requested() {
        let engine = StageEngine::new();
        let mut v = volunteer_at(Stage::Active, false);

        let unchanged = engine.attempt_transition(
            &mut v,
            Stage::Active,
            "manual:noop",
            TransitionAuthority::Automatic,
        );
        assert_eq!(unchanged, TransitionOutcome::Unchanged);
        assert!(v.stage_changed_reason.is_none());

        let locked = engine.attempt_transition(
            &mut v,
            Stage::Active,
            "manual:lock",
            TransitionAuthority::Reviewed { lock: true },
        );
        assert_eq!(locked, TransitionOutcome::LockApplied);
        assert!(v.stage_locked);
        // Lock-only: time and reason stay untouched.
        assert!(v.stage_last_changed_at.is_none());
        assert!(v.stage_changed_reason.is_none());

        let repeat = engine.attempt_transition(
            &mut v,
            Stage::Active,
            "manual:lock",
            TransitionAuthority::Reviewed { lock: true },
        );
        assert_eq!(repeat, TransitionOutcome::Unchanged);
    }

    #[test]
    fn promotion_thresholds_follow_the_arc() {
        let engine = StageEngine::new();

        let newcomer = volunteer_at(Stage::Newcomer, false);
        assert_eq!(
            engine.evaluate_auto_promotion(&newcomer, 0, &thresholds()),
            None
        );
        assert_eq!(
            engine.evaluate_auto_promotion(&newcomer, 1, &thresholds()),
            Some(Stage::Active)
        );

        let curious = volunteer_at(Stage::Curious, false);
        assert_eq!(
            engine.evaluate_auto_promotion(&curious, 1, &thresholds()),
            Some(Stage::Active)
        );

        let active = volunteer_at(Stage::Active, false);
        assert_eq!(
            engine.evaluate_auto_promotion(&active, 4, &thresholds()),
            None
        );
        assert_eq!(
            engine.evaluate_auto_promotion(&active, 5, &thresholds()),
            Some(Stage::Owner)
        );

        let owner = volunteer_at(Stage::Owner, false);
        assert_eq!(
            engine.evaluate_auto_promotion(&owner, 500, &thresholds()),
            None
        );
    }

    #[test]
    fn locked_or_gated_volunteers_never_get_recommendations() {
        let engine = StageEngine::new();

        let locked = volunteer_at(Stage::Active, true);
        assert_eq!(
            engine.evaluate_auto_promotion(&locked, 100, &thresholds()),
            None
        );

        for stage in [Stage::Team, Stage::Fundraising, Stage::Leader, Stage::Admin] {
            let gated = volunteer_at(stage, true);
            assert_eq!(
                engine.evaluate_auto_promotion(&gated, 100, &thresholds()),
                None
            );
        }
    }

    #[test]
    fn recommendations_are_never_gated() {
        let engine = StageEngine::new();
        let stages = [
            Stage::Newcomer,
            Stage::Curious,
            Stage::Active,
            Stage::Owner,
            Stage::Team,
            Stage::Fundraising,
            Stage::Leader,
            Stage::Admin,
        ];
        for stage in stages {
            for locked in [false, true] {
                for count in [0u64, 1, 5, 1_000] {
                    let v = volunteer_at(stage, locked);
                    if let Some(next) = engine.evaluate_auto_promotion(&v, count, &thresholds()) {
                        assert!(!next.is_gated(), "recommended gated stage {next}");
                    }
                }
            }
        }
    }
}
