//! In-memory reference implementation for the canvass storage traits.
//!
//! This adapter is deterministic and test-friendly. Production deployments
//! should use a transactional backend for source-of-truth data; the
//! uniqueness checks here mirror the constraints such a backend enforces.

use crate::model::{StageAuditAppend, StageAuditRecord};
use crate::traits::{
    ActivityStore, QueryWindow, RequestFilter, RequestStore, StageAuditStore, TeamStore,
    VolunteerStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use canvass_types::{
    ActivityRecord, ApprovalRequest, Capability, PowerTeam, RecruitLink, RequestId, RequestStatus,
    TeamId, Volunteer, VolunteerId,
};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory canvass storage adapter.
#[derive(Default)]
pub struct InMemoryCanvassStorage {
    volunteers: RwLock<HashMap<VolunteerId, Volunteer>>,
    activities: RwLock<Vec<ActivityRecord>>,
    /// Idempotency token index; the uniqueness backstop for races.
    tokens: RwLock<HashMap<String, usize>>,
    requests: RwLock<HashMap<RequestId, ApprovalRequest>>,
    teams: RwLock<HashMap<TeamId, PowerTeam>>,
    links: RwLock<HashMap<(TeamId, VolunteerId), RecruitLink>>,
    audits: RwLock<Vec<StageAuditRecord>>,
}

impl InMemoryCanvassStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolunteerStore for InMemoryCanvassStorage {
    async fn create_volunteer(&self, volunteer: Volunteer) -> StorageResult<Volunteer> {
        let mut guard = self
            .volunteers
            .write()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;

        if guard.contains_key(&volunteer.id) {
            return Err(StorageError::Conflict(format!(
                "volunteer {} already exists",
                volunteer.id
            )));
        }
        if guard
            .values()
            .any(|v| v.tracking_id == volunteer.tracking_id)
        {
            return Err(StorageError::Conflict(format!(
                "tracking id {} already registered",
                volunteer.tracking_id
            )));
        }
        if let Some(chat_id) = &volunteer.chat_id {
            if guard
                .values()
                .any(|v| v.chat_id.as_deref() == Some(chat_id.as_str()))
            {
                return Err(StorageError::Conflict(format!(
                    "chat id {chat_id} already registered"
                )));
            }
        }

        guard.insert(volunteer.id.clone(), volunteer.clone());
        Ok(volunteer)
    }

    async fn get_volunteer(&self, id: &VolunteerId) -> StorageResult<Option<Volunteer>> {
        let guard = self
            .volunteers
            .read()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn get_by_tracking_id(&self, tracking_id: &str) -> StorageResult<Option<Volunteer>> {
        let guard = self
            .volunteers
            .read()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .find(|v| v.tracking_id == tracking_id)
            .cloned())
    }

    async fn get_by_chat_id(&self, chat_id: &str) -> StorageResult<Option<Volunteer>> {
        let guard = self
            .volunteers
            .read()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .find(|v| v.chat_id.as_deref() == Some(chat_id))
            .cloned())
    }

    async fn update_volunteer(&self, volunteer: Volunteer) -> StorageResult<Volunteer> {
        let mut guard = self
            .volunteers
            .write()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;

        if !guard.contains_key(&volunteer.id) {
            return Err(StorageError::NotFound(format!(
                "volunteer {} not found",
                volunteer.id
            )));
        }
        if guard
            .values()
            .any(|v| v.id != volunteer.id && v.tracking_id == volunteer.tracking_id)
        {
            return Err(StorageError::Conflict(format!(
                "tracking id {} already registered",
                volunteer.tracking_id
            )));
        }
        if let Some(chat_id) = &volunteer.chat_id {
            if guard
                .values()
                .any(|v| v.id != volunteer.id && v.chat_id.as_deref() == Some(chat_id.as_str()))
            {
                return Err(StorageError::Conflict(format!(
                    "chat id {chat_id} already registered"
                )));
            }
        }

        guard.insert(volunteer.id.clone(), volunteer.clone());
        Ok(volunteer)
    }

    async fn list_volunteers(&self, window: QueryWindow) -> StorageResult<Vec<Volunteer>> {
        let guard = self
            .volunteers
            .read()
            .map_err(|_| StorageError::Backend("volunteers lock poisoned".to_string()))?;
        let mut values = guard.values().cloned().collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl ActivityStore for InMemoryCanvassStorage {
    async fn insert_activity(&self, record: ActivityRecord) -> StorageResult<ActivityRecord> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| StorageError::Backend("tokens lock poisoned".to_string()))?;
        let mut activities = self
            .activities
            .write()
            .map_err(|_| StorageError::Backend("activities lock poisoned".to_string()))?;

        if let Some(token) = &record.idempotency_token {
            if tokens.contains_key(token) {
                return Err(StorageError::Conflict(format!(
                    "idempotency token {token} already recorded"
                )));
            }
            tokens.insert(token.clone(), activities.len());
        }

        activities.push(record.clone());
        Ok(record)
    }

    async fn get_by_token(&self, token: &str) -> StorageResult<Option<ActivityRecord>> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| StorageError::Backend("tokens lock poisoned".to_string()))?;
        let activities = self
            .activities
            .read()
            .map_err(|_| StorageError::Backend("activities lock poisoned".to_string()))?;
        Ok(tokens
            .get(token)
            .and_then(|index| activities.get(*index))
            .cloned())
    }

    async fn count_for_actor(&self, actor: &VolunteerId) -> StorageResult<u64> {
        let activities = self
            .activities
            .read()
            .map_err(|_| StorageError::Backend("activities lock poisoned".to_string()))?;
        Ok(activities
            .iter()
            .filter(|record| record.actor.as_ref() == Some(actor))
            .count() as u64)
    }

    async fn list_for_actor(
        &self,
        actor: &VolunteerId,
        window: QueryWindow,
    ) -> StorageResult<Vec<ActivityRecord>> {
        let activities = self
            .activities
            .read()
            .map_err(|_| StorageError::Backend("activities lock poisoned".to_string()))?;
        let mut values = activities
            .iter()
            .filter(|record| record.actor.as_ref() == Some(actor))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl RequestStore for InMemoryCanvassStorage {
    async fn insert_request(&self, request: ApprovalRequest) -> StorageResult<ApprovalRequest> {
        let mut guard = self
            .requests
            .write()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;

        if guard.contains_key(&request.id) {
            return Err(StorageError::Conflict(format!(
                "request {} already exists",
                request.id
            )));
        }
        let duplicate_pending = guard.values().any(|existing| {
            existing.status == RequestStatus::Pending
                && existing.volunteer == request.volunteer
                && existing.capability == request.capability
        });
        if duplicate_pending {
            return Err(StorageError::Conflict(format!(
                "pending {} request already exists for volunteer {}",
                request.capability, request.volunteer
            )));
        }

        guard.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: &RequestId) -> StorageResult<Option<ApprovalRequest>> {
        let guard = self
            .requests
            .read()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn find_pending(
        &self,
        volunteer: &VolunteerId,
        capability: Capability,
    ) -> StorageResult<Option<ApprovalRequest>> {
        let guard = self
            .requests
            .read()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .find(|request| {
                request.status == RequestStatus::Pending
                    && &request.volunteer == volunteer
                    && request.capability == capability
            })
            .cloned())
    }

    async fn finalize_request(&self, updated: ApprovalRequest) -> StorageResult<ApprovalRequest> {
        let mut guard = self
            .requests
            .write()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        let stored = guard.get_mut(&updated.id).ok_or_else(|| {
            StorageError::NotFound(format!("request {} not found", updated.id))
        })?;

        if stored.status != RequestStatus::Pending {
            return Err(StorageError::InvariantViolation(format!(
                "request {} already reviewed ({})",
                updated.id,
                stored.status.as_str()
            )));
        }
        if !updated.status.is_terminal() {
            return Err(StorageError::InvalidInput(
                "finalize requires a terminal status".to_string(),
            ));
        }

        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_requests(
        &self,
        filter: RequestFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<ApprovalRequest>> {
        let guard = self
            .requests
            .read()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|request| {
                filter
                    .status
                    .map_or(true, |status| request.status == status)
                    && filter
                        .capability
                        .map_or(true, |capability| request.capability == capability)
                    && filter
                        .volunteer
                        .as_ref()
                        .map_or(true, |volunteer| &request.volunteer == volunteer)
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl TeamStore for InMemoryCanvassStorage {
    async fn insert_team(&self, team: PowerTeam) -> StorageResult<PowerTeam> {
        let mut guard = self
            .teams
            .write()
            .map_err(|_| StorageError::Backend("teams lock poisoned".to_string()))?;
        if guard.contains_key(&team.id) {
            return Err(StorageError::Conflict(format!(
                "team {} already exists",
                team.id
            )));
        }
        guard.insert(team.id.clone(), team.clone());
        Ok(team)
    }

    async fn get_team(&self, id: &TeamId) -> StorageResult<Option<PowerTeam>> {
        let guard = self
            .teams
            .read()
            .map_err(|_| StorageError::Backend("teams lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn upsert_link(&self, link: RecruitLink) -> StorageResult<RecruitLink> {
        let mut guard = self
            .links
            .write()
            .map_err(|_| StorageError::Backend("links lock poisoned".to_string()))?;
        let key = (link.team.clone(), link.child.clone());

        let stored = match guard.get(&key) {
            Some(existing) => RecruitLink {
                id: existing.id.clone(),
                created_at: existing.created_at,
                ..link
            },
            None => link,
        };
        guard.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_link(
        &self,
        team: &TeamId,
        child: &VolunteerId,
    ) -> StorageResult<Option<RecruitLink>> {
        let guard = self
            .links
            .read()
            .map_err(|_| StorageError::Backend("links lock poisoned".to_string()))?;
        Ok(guard.get(&(team.clone(), child.clone())).cloned())
    }

    async fn list_links(&self, team: &TeamId) -> StorageResult<Vec<RecruitLink>> {
        let guard = self
            .links
            .read()
            .map_err(|_| StorageError::Backend("links lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|link| &link.team == team)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

#[async_trait]
impl StageAuditStore for InMemoryCanvassStorage {
    async fn append_stage_audit(
        &self,
        event: StageAuditAppend,
    ) -> StorageResult<StageAuditRecord> {
        let mut guard = self
            .audits
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        let previous_hash = guard.last().map(|e| e.hash.clone());
        let sequence = guard.len() as u64 + 1;
        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;

        let record = StageAuditRecord {
            event_id: format!("audit-{}", Uuid::new_v4()),
            sequence,
            timestamp: event.timestamp,
            volunteer: event.volunteer,
            from_stage: event.from_stage,
            to_stage: event.to_stage,
            reason: event.reason,
            locked: event.locked,
            previous_hash,
            hash,
        };

        guard.push(record.clone());
        Ok(record)
    }

    async fn list_stage_audit(&self, window: QueryWindow) -> StorageResult<Vec<StageAuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        let mut values = guard.clone();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }
}

fn compute_audit_hash(
    event: &StageAuditAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": event.timestamp,
        "volunteer": event.volunteer.0,
        "from_stage": event.from_stage,
        "to_stage": event.to_stage,
        "reason": event.reason,
        "locked": event.locked,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
