use crate::model::{StageAuditAppend, StageAuditRecord};
use crate::StorageResult;
use async_trait::async_trait;
use canvass_types::{
    ActivityRecord, ApprovalRequest, Capability, PowerTeam, RecruitLink, RequestId, RequestStatus,
    TeamId, Volunteer, VolunteerId,
};

/// Generic query window for paged reads. A zero limit means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Filter for approval request listings.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub capability: Option<Capability>,
    pub volunteer: Option<VolunteerId>,
}

/// Storage interface for volunteer records.
///
/// `create_volunteer` enforces tracking-id and chat-id uniqueness and
/// returns [`crate::StorageError::Conflict`] for a duplicate.
#[async_trait]
pub trait VolunteerStore: Send + Sync {
    async fn create_volunteer(&self, volunteer: Volunteer) -> StorageResult<Volunteer>;

    async fn get_volunteer(&self, id: &VolunteerId) -> StorageResult<Option<Volunteer>>;

    async fn get_by_tracking_id(&self, tracking_id: &str) -> StorageResult<Option<Volunteer>>;

    async fn get_by_chat_id(&self, chat_id: &str) -> StorageResult<Option<Volunteer>>;

    /// Replace a volunteer record wholesale; fails NotFound if absent.
    async fn update_volunteer(&self, volunteer: Volunteer) -> StorageResult<Volunteer>;

    async fn list_volunteers(&self, window: QueryWindow) -> StorageResult<Vec<Volunteer>>;
}

/// Storage interface for immutable activity records.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Insert a new record. A duplicate idempotency token is a Conflict;
    /// the caller re-fetches the winning row via `get_by_token`.
    async fn insert_activity(&self, record: ActivityRecord) -> StorageResult<ActivityRecord>;

    async fn get_by_token(&self, token: &str) -> StorageResult<Option<ActivityRecord>>;

    /// Count all historical records attributed to an actor (cumulative).
    async fn count_for_actor(&self, actor: &VolunteerId) -> StorageResult<u64>;

    async fn list_for_actor(
        &self,
        actor: &VolunteerId,
        window: QueryWindow,
    ) -> StorageResult<Vec<ActivityRecord>>;
}

/// Storage interface for approval requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new pending request. A concurrent duplicate pending request
    /// for the same (volunteer, capability) pair is a Conflict.
    async fn insert_request(&self, request: ApprovalRequest) -> StorageResult<ApprovalRequest>;

    async fn get_request(&self, id: &RequestId) -> StorageResult<Option<ApprovalRequest>>;

    async fn find_pending(
        &self,
        volunteer: &VolunteerId,
        capability: Capability,
    ) -> StorageResult<Option<ApprovalRequest>>;

    /// Compare-and-swap the request from Pending into a terminal state.
    /// Fails InvariantViolation when the stored status is no longer Pending,
    /// which is what makes a review decision exactly-once.
    async fn finalize_request(&self, updated: ApprovalRequest) -> StorageResult<ApprovalRequest>;

    async fn list_requests(
        &self,
        filter: RequestFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<ApprovalRequest>>;
}

/// Storage interface for recruitment teams and links.
#[async_trait]
pub trait TeamStore: Send + Sync {
    async fn insert_team(&self, team: PowerTeam) -> StorageResult<PowerTeam>;

    async fn get_team(&self, id: &TeamId) -> StorageResult<Option<PowerTeam>>;

    /// Upsert keyed by (team, child): an existing link keeps its id and
    /// created_at, everything else is replaced.
    async fn upsert_link(&self, link: RecruitLink) -> StorageResult<RecruitLink>;

    async fn get_link(
        &self,
        team: &TeamId,
        child: &VolunteerId,
    ) -> StorageResult<Option<RecruitLink>>;

    async fn list_links(&self, team: &TeamId) -> StorageResult<Vec<RecruitLink>>;
}

/// Storage interface for the append-only stage-change audit chain.
#[async_trait]
pub trait StageAuditStore: Send + Sync {
    /// Append an event and return the canonical, hash-linked stored record.
    async fn append_stage_audit(&self, event: StageAuditAppend)
        -> StorageResult<StageAuditRecord>;

    /// Read events newest-first.
    async fn list_stage_audit(&self, window: QueryWindow) -> StorageResult<Vec<StageAuditRecord>>;
}

/// Unified storage bundle used by the canvass domain components.
pub trait CanvassStorage:
    VolunteerStore + ActivityStore + RequestStore + TeamStore + StageAuditStore + Send + Sync
{
}

impl<T> CanvassStorage for T where
    T: VolunteerStore + ActivityStore + RequestStore + TeamStore + StageAuditStore + Send + Sync
{
}
