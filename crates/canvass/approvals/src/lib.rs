//! Canvass Approvals - the reviewed gate into privileged stages.
//!
//! A request moves pending → approved or pending → denied, exactly once.
//! Approving a request is the ONLY call site in the system that moves a
//! volunteer into a gated stage, and it always sets the stage lock in the
//! same operation. The review stamp uses a compare-and-swap on the stored
//! request so a racing second reviewer loses cleanly.

#![deny(unsafe_code)]

use canvass_stage::{StageEngine, TransitionAuthority, TransitionOutcome};
use canvass_storage::{CanvassStorage, RequestFilter, StageAuditAppend, StorageError};
use canvass_types::{
    ApprovalRequest, Capability, RequestId, RequestStatus, ValidationError, Volunteer, VolunteerId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// A loose reference to a volunteer, as submitters and reviewers supply it.
/// Resolution order: id, then tracking id, then chat id. A reference that
/// carries a tracking id may be auto-created on first contact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolunteerRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<VolunteerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl VolunteerRef {
    pub fn by_id(id: VolunteerId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_tracking_id(tracking_id: impl Into<String>) -> Self {
        Self {
            tracking_id: Some(tracking_id.into()),
            ..Self::default()
        }
    }
}

/// A capability ask as submitted by a caller; the capability spelling is
/// normalized before anything touches storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub requester: VolunteerRef,
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Parsed review decision; rejected before any storage interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approve,
    Deny,
}

impl ReviewDecision {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(ReviewDecision::Approve),
            "deny" | "denied" => Ok(ReviewDecision::Deny),
            other => Err(ValidationError::UnknownDecision(other.to_string())),
        }
    }
}

/// Result of a review: the finalized request, plus the stage that was
/// applied when the decision was an approval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub request: ApprovalRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_stage: Option<canvass_types::Stage>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("request already reviewed: {0}")]
    AlreadyReviewed(String),

    #[error("volunteer not found: {0}")]
    VolunteerNotFound(String),

    #[error("requester could not be resolved or created")]
    RequesterUnresolved,

    #[error("reviewer could not be resolved or created")]
    ReviewerUnresolved,

    /// The review stamp landed but the coupled stage mutation failed. The
    /// trust state is inconsistent and the caller must see it.
    #[error("request {0} reviewed but stage mutation failed: {1}")]
    PartialApproval(String, String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for ApprovalError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvariantViolation(msg) => Self::AlreadyReviewed(msg),
            StorageError::NotFound(msg) => Self::RequestNotFound(msg),
            StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Storage(msg),
        }
    }
}

/// The approval workflow facade.
pub struct ApprovalWorkflow {
    storage: Arc<dyn CanvassStorage>,
    engine: StageEngine,
}

impl ApprovalWorkflow {
    pub fn new(storage: Arc<dyn CanvassStorage>) -> Self {
        Self {
            storage,
            engine: StageEngine::new(),
        }
    }

    /// Access the underlying storage backend.
    pub fn storage(&self) -> Arc<dyn CanvassStorage> {
        Arc::clone(&self.storage)
    }

    /// Submit a capability request. Idempotent per (volunteer, capability):
    /// an existing pending request is returned unchanged.
    pub async fn submit(&self, submission: SubmitRequest) -> Result<ApprovalRequest, ApprovalError> {
        let capability = Capability::normalize(&submission.capability)?;
        let requester = self
            .resolve_or_create(&submission.requester)
            .await?
            .ok_or(ApprovalError::RequesterUnresolved)?;

        if let Some(pending) = self
            .storage
            .find_pending(&requester.id, capability)
            .await?
        {
            return Ok(pending);
        }

        let request = ApprovalRequest {
            id: RequestId::generate(),
            volunteer: requester.id.clone(),
            capability,
            status: RequestStatus::Pending,
            note: submission.note,
            created_at: Utc::now(),
            reviewed_at: None,
            reviewed_by: None,
            review_note: None,
        };

        match self.storage.insert_request(request.clone()).await {
            Ok(stored) => {
                info!(
                    request = %stored.id,
                    volunteer = %stored.volunteer,
                    capability = %stored.capability,
                    "Approval request created"
                );
                Ok(stored)
            }
            // Lost a duplicate-pending race: the existing row is the answer.
            Err(StorageError::Conflict(_)) => self
                .storage
                .find_pending(&requester.id, capability)
                .await?
                .ok_or_else(|| {
                    ApprovalError::Storage(
                        "pending request conflicted but winning row is missing".to_string(),
                    )
                }),
            Err(other) => Err(other.into()),
        }
    }

    /// Review a pending request. The decision is exactly-once; on approval
    /// the review and the stage mutation form one logical unit.
    pub async fn review(
        &self,
        request_id: &RequestId,
        decision: &str,
        reviewer: VolunteerRef,
        note: Option<String>,
    ) -> Result<ReviewOutcome, ApprovalError> {
        let decision = ReviewDecision::parse(decision)?;

        let request = self
            .storage
            .get_request(request_id)
            .await?
            .ok_or_else(|| ApprovalError::RequestNotFound(request_id.to_string()))?;
        if request.status.is_terminal() {
            return Err(ApprovalError::AlreadyReviewed(request_id.to_string()));
        }

        let reviewer = self
            .resolve_or_create(&reviewer)
            .await?
            .ok_or(ApprovalError::ReviewerUnresolved)?;

        let mut finalized = request.clone();
        finalized.status = match decision {
            ReviewDecision::Approve => RequestStatus::Approved,
            ReviewDecision::Deny => RequestStatus::Denied,
        };
        finalized.reviewed_at = Some(Utc::now());
        finalized.reviewed_by = Some(reviewer.id.clone());
        finalized.review_note = note;

        // The CAS on pending status makes this the exactly-once point: a
        // racing second review fails here as AlreadyReviewed.
        let finalized = self.storage.finalize_request(finalized).await?;

        info!(
            request = %finalized.id,
            reviewer = %reviewer.id,
            status = finalized.status.as_str(),
            "Approval request reviewed"
        );

        match decision {
            ReviewDecision::Deny => Ok(ReviewOutcome {
                request: finalized,
                new_stage: None,
            }),
            ReviewDecision::Approve => {
                let new_stage = self.apply_approval(&finalized).await.map_err(|err| {
                    warn!(
                        request = %finalized.id,
                        error = %err,
                        "Approved request could not apply its stage mutation"
                    );
                    ApprovalError::PartialApproval(finalized.id.to_string(), err.to_string())
                })?;
                Ok(ReviewOutcome {
                    request: finalized,
                    new_stage,
                })
            }
        }
    }

    /// List requests; capability and status always render canonically.
    pub async fn list(&self, filter: RequestFilter) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        Ok(self
            .storage
            .list_requests(filter, Default::default())
            .await?)
    }

    /// The coupled half of an approval: gated stage + lock + capability flag.
    async fn apply_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<Option<canvass_types::Stage>, ApprovalError> {
        let mut volunteer = self
            .storage
            .get_volunteer(&request.volunteer)
            .await?
            .ok_or_else(|| ApprovalError::VolunteerNotFound(request.volunteer.to_string()))?;

        let target = request.capability.target_stage();
        let reason = format!("approved:{}", request.capability);
        let outcome = self.engine.attempt_transition(
            &mut volunteer,
            target,
            &reason,
            TransitionAuthority::Reviewed { lock: true },
        );

        volunteer.set_capability(request.capability, true);
        self.storage.update_volunteer(volunteer.clone()).await?;

        if let TransitionOutcome::Applied { from, to } = outcome {
            self.storage
                .append_stage_audit(StageAuditAppend {
                    timestamp: Utc::now(),
                    volunteer: volunteer.id.clone(),
                    from_stage: from.as_str().to_string(),
                    to_stage: to.as_str().to_string(),
                    reason,
                    locked: true,
                })
                .await?;
            Ok(Some(to))
        } else {
            Ok(None)
        }
    }

    async fn resolve_or_create(
        &self,
        reference: &VolunteerRef,
    ) -> Result<Option<Volunteer>, ApprovalError> {
        if let Some(id) = &reference.id {
            if let Some(found) = self.storage.get_volunteer(id).await? {
                return Ok(Some(found));
            }
        }
        if let Some(tracking_id) = &reference.tracking_id {
            if let Some(found) = self.storage.get_by_tracking_id(tracking_id).await? {
                return Ok(Some(found));
            }
        }
        if let Some(chat_id) = &reference.chat_id {
            if let Some(found) = self.storage.get_by_chat_id(chat_id).await? {
                return Ok(Some(found));
            }
        }

        // First contact: auto-create when the reference is concrete enough.
        let Some(tracking_id) = &reference.tracking_id else {
            return Ok(None);
        };
        let display_name = reference
            .display_name
            .clone()
            .unwrap_or_else(|| tracking_id.clone());
        let mut volunteer = Volunteer::new(tracking_id.clone(), display_name);
        volunteer.chat_id = reference.chat_id.clone();

        match self.storage.create_volunteer(volunteer).await {
            Ok(created) => Ok(Some(created)),
            // Lost a registration race: re-fetch the winner.
            Err(StorageError::Conflict(_)) => {
                Ok(self.storage.get_by_tracking_id(tracking_id).await?)
            }
            Err(other) => Err(other.into()),
        }
    }
}
