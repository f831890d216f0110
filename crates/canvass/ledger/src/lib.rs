//! Canvass Ledger - idempotent activity ingestion.
//!
//! The ledger records discrete volunteer actions, collapses duplicate
//! submissions by idempotency token, and after each genuinely new record
//! evaluates auto-promotion for the actor. Ingestion is the higher-value
//! operation: a failed promotion attempt is logged and reported in the
//! outcome, never allowed to reject the ingested record.

#![deny(unsafe_code)]

use canvass_stage::{PromotionThresholds, StageEngine, TransitionAuthority, TransitionOutcome};
use canvass_storage::{CanvassStorage, StageAuditAppend, StorageError};
use canvass_types::{
    ActivityId, ActivityRecord, CoreConfig, Stage, Volunteer, VolunteerId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// A submitted activity, before validation and persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewActivity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<VolunteerId>,
    /// Free-form action tag (call, text, door-knock, event, ...). The
    /// ledger accepts unknown tags as opaque.
    pub action: String,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewActivity {
    pub fn new(action: impl Into<String>, quantity: u32) -> Self {
        Self {
            actor: None,
            action: action.into(),
            quantity,
            occurred_at: None,
            idempotency_token: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn by(mut self, actor: VolunteerId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }
}

/// Outcome of the best-effort promotion side effect, kept separate from the
/// primary ingestion outcome so callers (and tests) can tell them apart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionOutcome {
    /// Dedup hit, actor missing, or auto-promotion disabled by config.
    NotEvaluated,
    /// Evaluated; the volunteer has not earned the next stage.
    NotEligible,
    /// The guarded transition applied.
    Promoted { from: Stage, to: Stage },
    /// The side effect failed; the activity record stands regardless.
    Failed { detail: String },
}

/// Result of one ingestion call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub record: ActivityRecord,
    /// True when the idempotency token had been seen before; the returned
    /// record is the original, unchanged.
    pub deduplicated: bool,
    /// The actor's stage after this call, for callers surfacing it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_stage: Option<Stage>,
    pub promotion: PromotionOutcome,
}

/// Ledger-level errors (primary path only; promotion failures are folded
/// into [`PromotionOutcome::Failed`]).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::ActorNotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvariantViolation(msg)
            | StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Storage(msg),
        }
    }
}

/// The activity ledger facade.
pub struct ActivityLedger {
    storage: Arc<dyn CanvassStorage>,
    engine: StageEngine,
    config: CoreConfig,
}

impl ActivityLedger {
    pub fn new(storage: Arc<dyn CanvassStorage>, config: CoreConfig) -> Self {
        Self {
            storage,
            engine: StageEngine::new(),
            config,
        }
    }

    /// Access the underlying storage backend.
    pub fn storage(&self) -> Arc<dyn CanvassStorage> {
        Arc::clone(&self.storage)
    }

    /// Ingest one activity submission.
    ///
    /// The dedup check precedes persistence: a token that has been seen
    /// returns the original record immediately, making dropped-response
    /// retries safe. If two submissions race past that check, the storage
    /// backend's token uniqueness is the final arbiter and the loser
    /// re-fetches the winning row.
    pub async fn ingest(&self, submission: NewActivity) -> Result<IngestOutcome, LedgerError> {
        if let Some(token) = &submission.idempotency_token {
            if let Some(existing) = self.storage.get_by_token(token).await? {
                return self.deduplicated_outcome(existing).await;
            }
        }

        let record = ActivityRecord {
            id: ActivityId::generate(),
            actor: submission.actor,
            action: submission.action,
            quantity: submission.quantity.clamp(1, self.config.max_activity_quantity),
            occurred_at: submission.occurred_at.unwrap_or_else(Utc::now),
            idempotency_token: submission.idempotency_token,
            metadata: submission.metadata,
            recorded_at: Utc::now(),
        };

        let record = match self.storage.insert_activity(record.clone()).await {
            Ok(stored) => stored,
            // Lost a token race: the winning row is the record of truth.
            Err(StorageError::Conflict(_)) => {
                let token = record_token_for_refetch(&record)?;
                let winner = self.storage.get_by_token(&token).await?.ok_or_else(|| {
                    LedgerError::Storage(format!(
                        "token {token} conflicted but winning row is missing"
                    ))
                })?;
                return self.deduplicated_outcome(winner).await;
            }
            Err(other) => return Err(other.into()),
        };

        info!(
            activity = ?record.id,
            action = %record.action,
            quantity = record.quantity,
            "Activity recorded"
        );

        let (actor_stage, promotion) = match &record.actor {
            Some(actor) => self.auto_promote(actor).await,
            None => (None, PromotionOutcome::NotEvaluated),
        };

        Ok(IngestOutcome {
            record,
            deduplicated: false,
            actor_stage,
            promotion,
        })
    }

    async fn deduplicated_outcome(
        &self,
        record: ActivityRecord,
    ) -> Result<IngestOutcome, LedgerError> {
        let actor_stage = match &record.actor {
            Some(actor) => self
                .storage
                .get_volunteer(actor)
                .await?
                .map(|volunteer| volunteer.stage),
            None => None,
        };
        Ok(IngestOutcome {
            record,
            deduplicated: true,
            actor_stage,
            promotion: PromotionOutcome::NotEvaluated,
        })
    }

    /// Best-effort promotion side effect. Every failure path is captured in
    /// the returned [`PromotionOutcome`] and logged; nothing propagates.
    async fn auto_promote(
        &self,
        actor: &VolunteerId,
    ) -> (Option<Stage>, PromotionOutcome) {
        if !self.config.auto_promotion_enabled {
            let stage = self.current_stage(actor).await;
            return (stage, PromotionOutcome::NotEvaluated);
        }

        match self.try_promote(actor).await {
            Ok((stage, outcome)) => (Some(stage), outcome),
            Err(err) => {
                warn!(
                    actor = %actor,
                    error = %err,
                    "Auto-promotion failed; activity record stands"
                );
                let stage = self.current_stage(actor).await;
                (
                    stage,
                    PromotionOutcome::Failed {
                        detail: err.to_string(),
                    },
                )
            }
        }
    }

    async fn try_promote(
        &self,
        actor: &VolunteerId,
    ) -> Result<(Stage, PromotionOutcome), LedgerError> {
        let mut volunteer = self
            .storage
            .get_volunteer(actor)
            .await?
            .ok_or_else(|| LedgerError::ActorNotFound(actor.to_string()))?;

        let count = self.storage.count_for_actor(actor).await?;
        let thresholds = PromotionThresholds::from(&self.config);

        let Some(next) = self
            .engine
            .evaluate_auto_promotion(&volunteer, count, &thresholds)
        else {
            return Ok((volunteer.stage, PromotionOutcome::NotEligible));
        };

        // Second guard: the decision function never recommends a gated
        // stage, and even if it did the promotion must not happen.
        if next.is_gated() {
            return Ok((volunteer.stage, PromotionOutcome::NotEligible));
        }

        let reason = format!("auto:{}->{}", volunteer.stage, next);
        let outcome = self.engine.attempt_transition(
            &mut volunteer,
            next,
            &reason,
            TransitionAuthority::Automatic,
        );

        match outcome {
            TransitionOutcome::Applied { from, to } => {
                self.storage.update_volunteer(volunteer.clone()).await?;
                self.storage
                    .append_stage_audit(StageAuditAppend {
                        timestamp: Utc::now(),
                        volunteer: volunteer.id.clone(),
                        from_stage: from.as_str().to_string(),
                        to_stage: to.as_str().to_string(),
                        reason,
                        locked: volunteer.stage_locked,
                    })
                    .await?;
                Ok((to, PromotionOutcome::Promoted { from, to }))
            }
            _ => Ok((volunteer.stage, PromotionOutcome::NotEligible)),
        }
    }

    async fn current_stage(&self, actor: &VolunteerId) -> Option<Stage> {
        self.storage
            .get_volunteer(actor)
            .await
            .ok()
            .flatten()
            .map(|volunteer: Volunteer| volunteer.stage)
    }
}

fn record_token_for_refetch(record: &ActivityRecord) -> Result<String, LedgerError> {
    record.idempotency_token.clone().ok_or_else(|| {
        LedgerError::Storage("insert conflicted without an idempotency token".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvass_storage::memory::InMemoryCanvassStorage;
    use canvass_storage::VolunteerStore;
    use proptest::prelude::*;
    use std::collections::HashSet;

    async fn ledger_with_actor() -> (ActivityLedger, VolunteerId) {
        let storage = Arc::new(InMemoryCanvassStorage::new());
        let actor = storage
            .create_volunteer(Volunteer::new("track-1", "Ada"))
            .await
            .unwrap();
        (
            ActivityLedger::new(storage, CoreConfig::default()),
            actor.id,
        )
    }

    #[tokio::test]
    async fn first_activity_promotes_newcomer_to_active() {
        let (ledger, actor) = ledger_with_actor().await;

        let outcome = ledger
            .ingest(NewActivity::new("call", 1).by(actor).with_token("t1"))
            .await
            .unwrap();

        assert!(!outcome.deduplicated);
        assert_eq!(outcome.actor_stage, Some(Stage::Active));
        assert_eq!(
            outcome.promotion,
            PromotionOutcome::Promoted {
                from: Stage::Newcomer,
                to: Stage::Active
            }
        );
    }

    #[tokio::test]
    async fn resubmitted_token_returns_original_record_unchanged() {
        let (ledger, actor) = ledger_with_actor().await;

        let first = ledger
            .ingest(NewActivity::new("call", 1).by(actor.clone()).with_token("t1"))
            .await
            .unwrap();
        let second = ledger
            .ingest(NewActivity::new("call", 1).by(actor).with_token("t1"))
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.promotion, PromotionOutcome::NotEvaluated);
        // Stage unchanged by the replay.
        assert_eq!(second.actor_stage, Some(Stage::Active));
    }

    #[tokio::test]
    async fn fifth_activity_promotes_active_to_owner() {
        let (ledger, actor) = ledger_with_actor().await;

        let mut last = None;
        for n in 0..5 {
            last = Some(
                ledger
                    .ingest(
                        NewActivity::new("door-knock", 1)
                            .by(actor.clone())
                            .with_token(format!("t{n}")),
                    )
                    .await
                    .unwrap(),
            );
        }

        let last = last.unwrap();
        assert_eq!(last.actor_stage, Some(Stage::Owner));
        assert_eq!(
            last.promotion,
            PromotionOutcome::Promoted {
                from: Stage::Active,
                to: Stage::Owner
            }
        );
    }

    #[tokio::test]
    async fn locked_volunteer_never_promotes() {
        let storage = Arc::new(InMemoryCanvassStorage::new());
        let mut volunteer = Volunteer::new("track-1", "Ada");
        volunteer.stage = Stage::Team;
        volunteer.stage_locked = true;
        let volunteer = storage.create_volunteer(volunteer).await.unwrap();
        let ledger = ActivityLedger::new(storage, CoreConfig::default());

        for n in 0..10 {
            let outcome = ledger
                .ingest(
                    NewActivity::new("call", 1)
                        .by(volunteer.id.clone())
                        .with_token(format!("t{n}")),
                )
                .await
                .unwrap();
            assert_eq!(outcome.actor_stage, Some(Stage::Team));
            assert_eq!(outcome.promotion, PromotionOutcome::NotEligible);
        }
    }

    #[tokio::test]
    async fn quantity_is_clamped_into_range() {
        let (ledger, actor) = ledger_with_actor().await;

        let zero = ledger
            .ingest(NewActivity::new("text", 0).by(actor.clone()))
            .await
            .unwrap();
        assert_eq!(zero.record.quantity, 1);

        let huge = ledger
            .ingest(NewActivity::new("text", 1_000_000).by(actor))
            .await
            .unwrap();
        assert_eq!(huge.record.quantity, 10_000);
    }

    #[tokio::test]
    async fn unknown_action_tags_are_accepted_as_opaque() {
        let (ledger, actor) = ledger_with_actor().await;
        let outcome = ledger
            .ingest(NewActivity::new("interpretive-dance", 2).by(actor))
            .await
            .unwrap();
        assert_eq!(outcome.record.action, "interpretive-dance");
    }

    #[tokio::test]
    async fn disabled_auto_promotion_records_without_evaluating() {
        let storage = Arc::new(InMemoryCanvassStorage::new());
        let actor = storage
            .create_volunteer(Volunteer::new("track-1", "Ada"))
            .await
            .unwrap();
        let config = CoreConfig {
            auto_promotion_enabled: false,
            ..CoreConfig::default()
        };
        let ledger = ActivityLedger::new(storage, config);

        let outcome = ledger
            .ingest(NewActivity::new("call", 1).by(actor.id))
            .await
            .unwrap();
        assert_eq!(outcome.promotion, PromotionOutcome::NotEvaluated);
        assert_eq!(outcome.actor_stage, Some(Stage::Newcomer));
    }

    #[tokio::test]
    async fn missing_actor_fails_the_side_effect_but_keeps_the_record() {
        let storage = Arc::new(InMemoryCanvassStorage::new());
        let ledger = ActivityLedger::new(storage, CoreConfig::default());

        let outcome = ledger
            .ingest(NewActivity::new("call", 1).by(VolunteerId::generate()))
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert!(matches!(
            outcome.promotion,
            PromotionOutcome::Failed { .. }
        ));
    }

    proptest! {
        // For any sequence of token submissions (with repeats), the store
        // holds exactly one record per distinct token and every repeat is
        // flagged as deduplicated.
        #[test]
        fn property_ingestion_is_idempotent_per_token(
            tokens in proptest::collection::vec(0u8..6, 1..24)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let (ledger, actor) = ledger_with_actor().await;
                let mut seen = HashSet::new();
                let mut stored = HashSet::new();

                for token in tokens {
                    let token = format!("t{token}");
                    let outcome = ledger
                        .ingest(
                            NewActivity::new("call", 1)
                                .by(actor.clone())
                                .with_token(token.clone()),
                        )
                        .await
                        .expect("ingest");

                    assert_eq!(outcome.deduplicated, !seen.insert(token));
                    stored.insert(outcome.record.id.clone());
                }

                assert_eq!(stored.len(), seen.len());
            });
        }
    }
}
