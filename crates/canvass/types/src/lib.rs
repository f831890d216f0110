//! Canvass Types - shared domain types for the volunteer trust core
//!
//! Every other canvass crate speaks in these types. The two enums that carry
//! policy weight are [`Stage`] (gated values are review-only) and
//! [`Capability`] (always normalized to its canonical spelling at the
//! boundary; internal logic only ever sees the canonical variant).

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
mod stage;

pub use config::CoreConfig;
pub use stage::Stage;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolunteerId(pub String);
impl VolunteerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for VolunteerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(pub String);
impl ActivityId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);
impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);
impl TeamId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub String);
impl LinkId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A gated capability a volunteer can request through the approval workflow.
///
/// Submitters historically used short names (`team`, `fund`) alongside the
/// canonical `*_access` names; [`Capability::normalize`] collapses all
/// accepted spellings into one variant so a request stored under spelling A
/// is indistinguishable from one stored under spelling B.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Team,
    Fundraising,
    Leader,
}

impl Capability {
    /// Canonical rendering used in storage and in every caller-facing view.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Team => "team_access",
            Capability::Fundraising => "fundraising_access",
            Capability::Leader => "leader_access",
        }
    }

    /// Normalize a submitted spelling (legacy short name or canonical name).
    pub fn normalize(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "team" | "team_access" => Ok(Capability::Team),
            "fund" | "fundraising" | "fundraising_access" => Ok(Capability::Fundraising),
            "leader" | "leader_access" => Ok(Capability::Leader),
            other => Err(ValidationError::UnknownCapability(other.to_string())),
        }
    }

    /// The gated stage an approved request of this capability confers.
    pub fn target_stage(&self) -> Stage {
        match self {
            Capability::Team => Stage::Team,
            Capability::Fundraising => Stage::Fundraising,
            Capability::Leader => Stage::Leader,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A volunteer moving through the trust progression.
///
/// Invariant: a volunteer in a gated stage has `stage_locked = true`; both
/// fields are only ever written together by a reviewed decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volunteer {
    pub id: VolunteerId,
    /// Stable external tracking identifier, unique across volunteers.
    pub tracking_id: String,
    /// Chat-platform identifier, unique when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub stage: Stage,
    pub stage_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_last_changed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_changed_reason: Option<String>,
    pub team_access: bool,
    pub fundraising_access: bool,
    pub leader_access: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl Volunteer {
    /// Create a fresh volunteer at the start of the trust arc.
    pub fn new(tracking_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: VolunteerId::generate(),
            tracking_id: tracking_id.into(),
            chat_id: None,
            display_name: display_name.into(),
            email: None,
            phone: None,
            stage: Stage::Newcomer,
            stage_locked: false,
            stage_last_changed_at: None,
            stage_changed_reason: None,
            team_access: false,
            fundraising_access: false,
            leader_access: false,
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Flag lookup by capability; the flags are independent of each other.
    pub fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::Team => self.team_access,
            Capability::Fundraising => self.fundraising_access,
            Capability::Leader => self.leader_access,
        }
    }

    pub fn set_capability(&mut self, capability: Capability, granted: bool) {
        match capability {
            Capability::Team => self.team_access = granted,
            Capability::Fundraising => self.fundraising_access = granted,
            Capability::Leader => self.leader_access = granted,
        }
    }
}

/// One discrete volunteer act (call, text, door-knock, event, ...).
///
/// Immutable once stored. When `idempotency_token` is present it is globally
/// unique; resubmission with the same token returns this record unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<VolunteerId>,
    /// Free-form action tag; the ledger does not validate taxonomy.
    pub action: String,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Status of an approval request; Pending is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "denied" => Ok(RequestStatus::Denied),
            other => Err(ValidationError::UnknownRequestStatus(other.to_string())),
        }
    }
}

/// A pending ask for a gated capability, resolved exactly once by review.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub volunteer: VolunteerId,
    pub capability: Capability,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<VolunteerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_note: Option<String>,
}

/// Lifecycle of a recruit within a team's tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkStatus {
    Invited,
    Onboarded,
    Active,
    Churned,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Invited => "invited",
            LinkStatus::Onboarded => "onboarded",
            LinkStatus::Active => "active",
            LinkStatus::Churned => "churned",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "invited" => Ok(LinkStatus::Invited),
            "onboarded" => Ok(LinkStatus::Onboarded),
            "active" => Ok(LinkStatus::Active),
            "churned" => Ok(LinkStatus::Churned),
            other => Err(ValidationError::UnknownLinkStatus(other.to_string())),
        }
    }
}

/// A directed parent→child edge in a team's recruitment tree.
///
/// Depth is derived at write time: the leader's direct recruits are depth 1,
/// every other node sits at its parent's depth + 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecruitLink {
    pub id: LinkId,
    pub team: TeamId,
    pub parent: VolunteerId,
    pub child: VolunteerId,
    pub depth: u32,
    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named recruitment grouping anchored by its leader volunteer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PowerTeam {
    pub id: TeamId,
    pub name: String,
    pub leader: VolunteerId,
    pub created_at: DateTime<Utc>,
}

impl PowerTeam {
    pub fn new(name: impl Into<String>, leader: VolunteerId) -> Self {
        Self {
            id: TeamId::generate(),
            name: name.into(),
            leader,
            created_at: Utc::now(),
        }
    }
}

/// Malformed enumerated values, rejected before any storage interaction.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown capability type: {0}")]
    UnknownCapability(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown review decision: {0}")]
    UnknownDecision(String),

    #[error("unknown request status: {0}")]
    UnknownRequestStatus(String),

    #[error("unknown link status: {0}")]
    UnknownLinkStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_spellings_collapse_to_canonical() {
        for raw in ["team", "TEAM", "team_access", " Team_Access "] {
            assert_eq!(Capability::normalize(raw).unwrap(), Capability::Team);
        }
        for raw in ["fund", "fundraising", "fundraising_access"] {
            assert_eq!(
                Capability::normalize(raw).unwrap(),
                Capability::Fundraising
            );
        }
        assert_eq!(
            Capability::normalize("leader").unwrap().as_str(),
            "leader_access"
        );
        assert!(matches!(
            Capability::normalize("treasurer"),
            Err(ValidationError::UnknownCapability(_))
        ));
    }

    #[test]
    fn capability_maps_to_gated_stage() {
        assert_eq!(Capability::Team.target_stage(), Stage::Team);
        assert_eq!(Capability::Fundraising.target_stage(), Stage::Fundraising);
        assert_eq!(Capability::Leader.target_stage(), Stage::Leader);
        assert!(Capability::Team.target_stage().is_gated());
    }

    #[test]
    fn new_volunteer_starts_unlocked_at_newcomer() {
        let v = Volunteer::new("track-1", "Ada");
        assert_eq!(v.stage, Stage::Newcomer);
        assert!(!v.stage_locked);
        assert!(!v.has_capability(Capability::Team));
    }

    #[test]
    fn capability_flags_are_independent() {
        let mut v = Volunteer::new("track-2", "Grace");
        v.set_capability(Capability::Fundraising, true);
        assert!(v.has_capability(Capability::Fundraising));
        assert!(!v.has_capability(Capability::Team));
        assert!(!v.has_capability(Capability::Leader));
    }
}
