//! Canvass Service - the composed facade over the volunteer trust core.
//!
//! This is the surface an HTTP layer or chat-bot command layer talks to.
//! It owns one storage handle shared by the activity ledger, the approval
//! workflow, and the recruitment tree, and it enforces the CRUD-side
//! policies: stage edits into gated values are always refused here (the
//! approval workflow is the only path in), and capability flags cannot be
//! flipped while a volunteer's stage is locked.

#![deny(unsafe_code)]

use canvass_approvals::{ApprovalError, ApprovalWorkflow, ReviewOutcome, SubmitRequest, VolunteerRef};
use canvass_ledger::{ActivityLedger, IngestOutcome, LedgerError, NewActivity};
use canvass_recruit::{RecruitError, RecruitTree, TeamAdjacency, TeamStats};
use canvass_stage::{StageEngine, TransitionAuthority, TransitionOutcome};
use canvass_storage::memory::InMemoryCanvassStorage;
use canvass_storage::{
    CanvassStorage, QueryWindow, RequestFilter, StageAuditAppend, StageAuditRecord, StorageError,
};
use canvass_types::{
    ApprovalRequest, Capability, CoreConfig, LinkStatus, PowerTeam, RecruitLink, RequestId,
    RequestStatus, Stage, TeamId, ValidationError, Volunteer, VolunteerId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Fields accepted when registering a volunteer directly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewVolunteer {
    pub tracking_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Partial profile update; `None` leaves a field untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Request listing filter as callers supply it, before normalization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volunteer: Option<VolunteerId>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Well-formed but forbidden by domain rule; branch, don't crash.
    #[error("refused: {0}")]
    PolicyRefusal(String),

    /// A uniqueness constraint lost a race; retry or re-fetch.
    #[error("conflict, retry or re-fetch: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Recruit(#[from] RecruitError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ServiceError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvariantViolation(msg)
            | StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Storage(msg),
        }
    }
}

/// The composed canvass core.
pub struct CanvassService {
    storage: Arc<dyn CanvassStorage>,
    engine: StageEngine,
    ledger: ActivityLedger,
    approvals: ApprovalWorkflow,
    recruit: RecruitTree,
}

impl CanvassService {
    /// Build a service over the in-memory reference backend.
    pub fn new(config: CoreConfig) -> Self {
        Self::with_storage(Arc::new(InMemoryCanvassStorage::new()), config)
    }

    /// Build a service over an explicit storage adapter.
    pub fn with_storage(storage: Arc<dyn CanvassStorage>, config: CoreConfig) -> Self {
        Self {
            ledger: ActivityLedger::new(Arc::clone(&storage), config),
            approvals: ApprovalWorkflow::new(Arc::clone(&storage)),
            recruit: RecruitTree::new(Arc::clone(&storage)),
            engine: StageEngine::new(),
            storage,
        }
    }

    /// Access the underlying storage backend.
    pub fn storage(&self) -> Arc<dyn CanvassStorage> {
        Arc::clone(&self.storage)
    }

    // ── Volunteer CRUD ──────────────────────────────────────────────

    pub async fn register_volunteer(&self, new: NewVolunteer) -> Result<Volunteer, ServiceError> {
        let mut volunteer = Volunteer::new(new.tracking_id, new.display_name);
        volunteer.chat_id = new.chat_id;
        volunteer.email = new.email;
        volunteer.phone = new.phone;

        let created = self.storage.create_volunteer(volunteer).await?;
        info!(volunteer = %created.id, tracking_id = %created.tracking_id, "Volunteer registered");
        Ok(created)
    }

    pub async fn get_volunteer(&self, id: &VolunteerId) -> Result<Volunteer, ServiceError> {
        self.storage
            .get_volunteer(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("volunteer {id}")))
    }

    pub async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Volunteer, ServiceError> {
        self.storage
            .get_by_tracking_id(tracking_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("tracking id {tracking_id}")))
    }

    pub async fn find_by_chat_id(&self, chat_id: &str) -> Result<Volunteer, ServiceError> {
        self.storage
            .get_by_chat_id(chat_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("chat id {chat_id}")))
    }

    pub async fn list_volunteers(
        &self,
        window: QueryWindow,
    ) -> Result<Vec<Volunteer>, ServiceError> {
        Ok(self.storage.list_volunteers(window).await?)
    }

    pub async fn update_profile(
        &self,
        id: &VolunteerId,
        update: ProfileUpdate,
    ) -> Result<Volunteer, ServiceError> {
        let mut volunteer = self.get_volunteer(id).await?;
        if let Some(display_name) = update.display_name {
            volunteer.display_name = display_name;
        }
        if let Some(chat_id) = update.chat_id {
            volunteer.chat_id = Some(chat_id);
        }
        if let Some(email) = update.email {
            volunteer.email = Some(email);
        }
        if let Some(phone) = update.phone {
            volunteer.phone = Some(phone);
        }
        Ok(self.storage.update_volunteer(volunteer).await?)
    }

    /// Manual stage edit from the CRUD surface. Gated targets are always
    /// refused here - the approval workflow is the only path into them -
    /// and a locked stage refuses this unreviewed change.
    pub async fn change_stage(
        &self,
        id: &VolunteerId,
        target: &str,
        verb: &str,
    ) -> Result<Volunteer, ServiceError> {
        let target = Stage::parse(target)?;
        if target.is_gated() {
            return Err(ServiceError::PolicyRefusal(format!(
                "stage {target} requires an approved {} request",
                capability_for_gated(target)
            )));
        }

        let mut volunteer = self.get_volunteer(id).await?;
        let reason = format!("manual:{verb}");
        let outcome = self.engine.attempt_transition(
            &mut volunteer,
            target,
            &reason,
            TransitionAuthority::Automatic,
        );

        match outcome {
            TransitionOutcome::Applied { from, to } => {
                let updated = self.storage.update_volunteer(volunteer).await?;
                self.storage
                    .append_stage_audit(StageAuditAppend {
                        timestamp: Utc::now(),
                        volunteer: updated.id.clone(),
                        from_stage: from.as_str().to_string(),
                        to_stage: to.as_str().to_string(),
                        reason,
                        locked: updated.stage_locked,
                    })
                    .await?;
                Ok(updated)
            }
            TransitionOutcome::Unchanged | TransitionOutcome::LockApplied => Ok(volunteer),
            TransitionOutcome::Refused { reason } => {
                Err(ServiceError::PolicyRefusal(reason.as_str().to_string()))
            }
        }
    }

    /// Flip a capability flag. Refused while the stage is locked: locked
    /// volunteers' permissions belong to the approval workflow.
    pub async fn set_capability_flag(
        &self,
        id: &VolunteerId,
        capability: &str,
        granted: bool,
    ) -> Result<Volunteer, ServiceError> {
        let capability = Capability::normalize(capability)?;
        let mut volunteer = self.get_volunteer(id).await?;
        if volunteer.stage_locked {
            return Err(ServiceError::PolicyRefusal(format!(
                "volunteer {id} is stage-locked; capability flags change only by review"
            )));
        }
        volunteer.set_capability(capability, granted);
        Ok(self.storage.update_volunteer(volunteer).await?)
    }

    // ── Activity ledger ─────────────────────────────────────────────

    pub async fn submit_activity(
        &self,
        submission: NewActivity,
    ) -> Result<IngestOutcome, ServiceError> {
        Ok(self.ledger.ingest(submission).await?)
    }

    // ── Approval workflow ───────────────────────────────────────────

    pub async fn submit_request(
        &self,
        submission: SubmitRequest,
    ) -> Result<ApprovalRequest, ServiceError> {
        Ok(self.approvals.submit(submission).await?)
    }

    pub async fn review_request(
        &self,
        request_id: &RequestId,
        decision: &str,
        reviewer: VolunteerRef,
        note: Option<String>,
    ) -> Result<ReviewOutcome, ServiceError> {
        Ok(self
            .approvals
            .review(request_id, decision, reviewer, note)
            .await?)
    }

    pub async fn list_requests(
        &self,
        query: RequestQuery,
    ) -> Result<Vec<ApprovalRequest>, ServiceError> {
        let filter = RequestFilter {
            status: query
                .status
                .as_deref()
                .map(RequestStatus::parse)
                .transpose()?,
            capability: query
                .capability
                .as_deref()
                .map(Capability::normalize)
                .transpose()?,
            volunteer: query.volunteer,
        };
        Ok(self.approvals.list(filter).await?)
    }

    // ── Recruitment tree ────────────────────────────────────────────

    pub async fn create_team(
        &self,
        name: &str,
        leader: VolunteerId,
    ) -> Result<PowerTeam, ServiceError> {
        // The leader must be a known volunteer before anchoring a tree.
        self.get_volunteer(&leader).await?;
        Ok(self.recruit.create_team(name, leader).await?)
    }

    pub async fn upsert_recruit_link(
        &self,
        team: &TeamId,
        parent: VolunteerId,
        child: VolunteerId,
        status: Option<&str>,
    ) -> Result<RecruitLink, ServiceError> {
        let status = status.map(LinkStatus::parse).transpose()?;
        Ok(self.recruit.upsert_link(team, parent, child, status).await?)
    }

    pub async fn team_stats(&self, team: &TeamId) -> Result<TeamStats, ServiceError> {
        Ok(self.recruit.team_stats(team).await?)
    }

    pub async fn team_adjacency(&self, team: &TeamId) -> Result<TeamAdjacency, ServiceError> {
        Ok(self.recruit.adjacency(team).await?)
    }

    // ── Audit surface ───────────────────────────────────────────────

    /// Stage-change audit records, newest-first, reason tags verbatim.
    pub async fn stage_audit(
        &self,
        window: QueryWindow,
    ) -> Result<Vec<StageAuditRecord>, ServiceError> {
        Ok(self.storage.list_stage_audit(window).await?)
    }
}

fn capability_for_gated(stage: Stage) -> &'static str {
    match stage {
        Stage::Team => Capability::Team.as_str(),
        Stage::Fundraising => Capability::Fundraising.as_str(),
        Stage::Leader => Capability::Leader.as_str(),
        _ => "administrative",
    }
}
