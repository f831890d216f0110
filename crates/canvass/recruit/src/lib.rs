//! Canvass Recruit - the "Power of 5" recruitment tree.
//!
//! Each team is a forest rooted at its leader: a child has at most one link
//! per team, depth 1 under the leader, and depth(parent) + 1 anywhere else.
//! A parent must already be anchored in the tree before a child can attach
//! under it - that forbids disconnected fragments and, since depth strictly
//! increases away from the leader, cycles cannot form.
//!
//! Depth is derived at mutation time, on every write, never by a periodic
//! batch recompute.

#![deny(unsafe_code)]

use canvass_storage::{CanvassStorage, StorageError};
use canvass_types::{LinkId, LinkStatus, PowerTeam, RecruitLink, TeamId, VolunteerId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Counts for a team's tree, grouped by link status and by depth.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TeamStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_depth: BTreeMap<u32, usize>,
}

/// Parent → children adjacency for rendering a team's tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeamAdjacency {
    pub team: TeamId,
    pub leader: VolunteerId,
    pub children: HashMap<VolunteerId, Vec<VolunteerId>>,
}

#[derive(Debug, Error)]
pub enum RecruitError {
    #[error("a volunteer cannot recruit themselves")]
    SelfLink,

    #[error("team not found: {0}")]
    TeamNotFound(String),

    #[error("parent {parent} is not part of team {team}'s tree")]
    ParentNotInTree { team: String, parent: String },

    #[error("attaching {child} under {parent} would make {child} its own ancestor")]
    WouldCycle { parent: String, child: String },

    #[error("the team leader roots the tree and cannot be attached as a child")]
    LeaderAsChild,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for RecruitError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::TeamNotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvariantViolation(msg)
            | StorageError::InvalidInput(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Storage(msg),
        }
    }
}

/// The recruitment tree facade.
pub struct RecruitTree {
    storage: Arc<dyn CanvassStorage>,
}

impl RecruitTree {
    pub fn new(storage: Arc<dyn CanvassStorage>) -> Self {
        Self { storage }
    }

    /// Access the underlying storage backend.
    pub fn storage(&self) -> Arc<dyn CanvassStorage> {
        Arc::clone(&self.storage)
    }

    /// Create a team anchored by its leader volunteer.
    pub async fn create_team(
        &self,
        name: impl Into<String>,
        leader: VolunteerId,
    ) -> Result<PowerTeam, RecruitError> {
        let team = self.storage.insert_team(PowerTeam::new(name, leader)).await?;
        info!(team = %team.id, leader = %team.leader, "Power team created");
        Ok(team)
    }

    /// Insert or update the link for `child` in this team.
    ///
    /// Depth resolution: 1 when the parent is the team leader; otherwise the
    /// parent must already be a child in this team's tree and the depth is
    /// the parent's depth + 1. Re-parenting is allowed and recomputes depth;
    /// when the child's own depth changes, the depths of its descendants are
    /// re-derived in the same write so the depth law holds for every link.
    ///
    /// A node can never become its own ancestor: the leader is refused as a
    /// child, and a re-parent whose ancestry chain passes through `child`
    /// is refused before anything is written.
    pub async fn upsert_link(
        &self,
        team_id: &TeamId,
        parent: VolunteerId,
        child: VolunteerId,
        status: Option<LinkStatus>,
    ) -> Result<RecruitLink, RecruitError> {
        if parent == child {
            return Err(RecruitError::SelfLink);
        }

        let team = self
            .storage
            .get_team(team_id)
            .await?
            .ok_or_else(|| RecruitError::TeamNotFound(team_id.to_string()))?;
        if child == team.leader {
            return Err(RecruitError::LeaderAsChild);
        }

        let depth = if parent == team.leader {
            1
        } else {
            self.ensure_not_descendant(team_id, &team.leader, &parent, &child)
                .await?;
            let parent_link = self
                .storage
                .get_link(team_id, &parent)
                .await?
                .ok_or_else(|| RecruitError::ParentNotInTree {
                    team: team_id.to_string(),
                    parent: parent.to_string(),
                })?;
            parent_link.depth + 1
        };

        let existing = self.storage.get_link(team_id, &child).await?;
        let status = status
            .or_else(|| existing.as_ref().map(|link| link.status))
            .unwrap_or(LinkStatus::Invited);
        let depth_changed = existing
            .as_ref()
            .map(|link| link.depth != depth)
            .unwrap_or(false);

        let now = Utc::now();
        let stored = self
            .storage
            .upsert_link(RecruitLink {
                id: LinkId::generate(),
                team: team_id.clone(),
                parent,
                child: child.clone(),
                depth,
                status,
                created_at: now,
                updated_at: now,
            })
            .await?;

        debug!(
            team = %team_id,
            child = %child,
            depth = stored.depth,
            status = stored.status.as_str(),
            "Recruit link upserted"
        );

        if depth_changed {
            self.recompute_descendants(team_id, &child, depth).await?;
        }

        Ok(stored)
    }

    /// Count links by status and by depth.
    pub async fn team_stats(&self, team_id: &TeamId) -> Result<TeamStats, RecruitError> {
        self.require_team(team_id).await?;
        let links = self.storage.list_links(team_id).await?;

        let mut stats = TeamStats {
            total: links.len(),
            ..TeamStats::default()
        };
        for link in links {
            *stats
                .by_status
                .entry(link.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_depth.entry(link.depth).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Build the parent → children adjacency for rendering.
    pub async fn adjacency(&self, team_id: &TeamId) -> Result<TeamAdjacency, RecruitError> {
        let team = self.require_team(team_id).await?;
        let links = self.storage.list_links(team_id).await?;

        let mut children: HashMap<VolunteerId, Vec<VolunteerId>> = HashMap::new();
        for link in links {
            children.entry(link.parent).or_default().push(link.child);
        }
        Ok(TeamAdjacency {
            team: team.id,
            leader: team.leader,
            children,
        })
    }

    /// Walk the ancestry chain from `parent` toward the leader and refuse
    /// when it passes through `child`: attaching there would detach the
    /// subtree into a cycle unreachable from the leader. The chain in a
    /// consistent store strictly shortens toward the leader; the visited
    /// set bounds the walk regardless.
    async fn ensure_not_descendant(
        &self,
        team_id: &TeamId,
        leader: &VolunteerId,
        parent: &VolunteerId,
        child: &VolunteerId,
    ) -> Result<(), RecruitError> {
        let mut visited = HashSet::new();
        let mut current = parent.clone();
        loop {
            if &current == child {
                return Err(RecruitError::WouldCycle {
                    parent: parent.to_string(),
                    child: child.to_string(),
                });
            }
            if &current == leader || !visited.insert(current.clone()) {
                return Ok(());
            }
            match self.storage.get_link(team_id, &current).await? {
                Some(link) => current = link.parent,
                // Chain ends off-tree; the ParentNotInTree check follows.
                None => return Ok(()),
            }
        }
    }

    async fn require_team(&self, team_id: &TeamId) -> Result<PowerTeam, RecruitError> {
        self.storage
            .get_team(team_id)
            .await?
            .ok_or_else(|| RecruitError::TeamNotFound(team_id.to_string()))
    }

    /// Re-derive depths below a re-parented node, breadth-first from the
    /// node's new depth. The parent chain is acyclic by construction, so
    /// this terminates.
    async fn recompute_descendants(
        &self,
        team_id: &TeamId,
        root: &VolunteerId,
        root_depth: u32,
    ) -> Result<(), RecruitError> {
        let links = self.storage.list_links(team_id).await?;
        let mut by_parent: HashMap<VolunteerId, Vec<RecruitLink>> = HashMap::new();
        for link in links {
            by_parent.entry(link.parent.clone()).or_default().push(link);
        }

        let mut queue = VecDeque::from([(root.clone(), root_depth)]);
        while let Some((node, node_depth)) = queue.pop_front() {
            let Some(child_links) = by_parent.remove(&node) else {
                continue;
            };
            for link in child_links {
                let expected = node_depth + 1;
                queue.push_back((link.child.clone(), expected));
                if link.depth != expected {
                    self.storage
                        .upsert_link(RecruitLink {
                            depth: expected,
                            updated_at: Utc::now(),
                            ..link
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<VolunteerId> {
        (0..n).map(|_| VolunteerId::generate()).collect()
    }

    async fn tree_with_team() -> (RecruitTree, PowerTeam, VolunteerId) {
        let storage = Arc::new(canvass_storage::memory::InMemoryCanvassStorage::new());
        let tree = RecruitTree::new(storage);
        let leader = VolunteerId::generate();
        let team = tree.create_team("Power of 5", leader.clone()).await.unwrap();
        (tree, team, leader)
    }

    #[tokio::test]
    async fn leader_children_are_depth_one() {
        let (tree, team, leader) = tree_with_team().await;
        let [child] = &ids(1)[..] else { unreachable!() };

        let link = tree
            .upsert_link(&team.id, leader, child.clone(), None)
            .await
            .unwrap();
        assert_eq!(link.depth, 1);
        assert_eq!(link.status, LinkStatus::Invited);
    }

    #[tokio::test]
    async fn depth_follows_the_parent_chain() {
        let (tree, team, leader) = tree_with_team().await;
        let chain = ids(3);

        tree.upsert_link(&team.id, leader, chain[0].clone(), None)
            .await
            .unwrap();
        let second = tree
            .upsert_link(&team.id, chain[0].clone(), chain[1].clone(), None)
            .await
            .unwrap();
        let third = tree
            .upsert_link(&team.id, chain[1].clone(), chain[2].clone(), None)
            .await
            .unwrap();

        assert_eq!(second.depth, 2);
        assert_eq!(third.depth, 3);
    }

    #[tokio::test]
    async fn self_link_is_rejected() {
        let (tree, team, _) = tree_with_team().await;
        let v = VolunteerId::generate();
        let result = tree.upsert_link(&team.id, v.clone(), v, None).await;
        assert!(matches!(result, Err(RecruitError::SelfLink)));
    }

    #[tokio::test]
    async fn disconnected_parent_is_refused() {
        let (tree, team, _) = tree_with_team().await;
        let [stranger, child] = &ids(2)[..] else {
            unreachable!()
        };

        let result = tree
            .upsert_link(&team.id, stranger.clone(), child.clone(), None)
            .await;
        assert!(matches!(result, Err(RecruitError::ParentNotInTree { .. })));
    }

    #[tokio::test]
    async fn reparenting_recomputes_descendant_depths() {
        let (tree, team, leader) = tree_with_team().await;
        let v = ids(4);

        // leader -> a -> b -> c, plus leader -> d
        tree.upsert_link(&team.id, leader.clone(), v[0].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[0].clone(), v[1].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[1].clone(), v[2].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, leader.clone(), v[3].clone(), None)
            .await
            .unwrap();

        // Re-parent b directly under the leader: b drops to depth 1 and its
        // descendant c must follow to depth 2.
        let moved = tree
            .upsert_link(&team.id, leader.clone(), v[1].clone(), None)
            .await
            .unwrap();
        assert_eq!(moved.depth, 1);

        let c = tree
            .storage()
            .get_link(&team.id, &v[2])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.depth, 2);

        // Depth law holds for every stored link.
        let storage = tree.storage();
        let team_row = storage.get_team(&team.id).await.unwrap().unwrap();
        let links = storage.list_links(&team.id).await.unwrap();
        let depth_of: HashMap<_, _> = links
            .iter()
            .map(|link| (link.child.clone(), link.depth))
            .collect();
        for link in &links {
            if link.parent == team_row.leader {
                assert_eq!(link.depth, 1);
            } else {
                assert_eq!(link.depth, depth_of[&link.parent] + 1);
            }
        }
    }

    #[tokio::test]
    async fn reparent_under_own_descendant_is_refused() {
        let (tree, team, leader) = tree_with_team().await;
        let [a, b] = &ids(2)[..] else { unreachable!() };

        // leader -> a -> b
        tree.upsert_link(&team.id, leader.clone(), a.clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, a.clone(), b.clone(), None)
            .await
            .unwrap();

        // Moving a under its own descendant b would detach a <-> b from
        // the leader as a cycle.
        let result = tree
            .upsert_link(&team.id, b.clone(), a.clone(), None)
            .await;
        assert!(matches!(result, Err(RecruitError::WouldCycle { .. })));

        // Nothing was written: a still hangs off the leader at depth 1.
        let a_link = tree.storage().get_link(&team.id, a).await.unwrap().unwrap();
        assert_eq!(a_link.parent, leader);
        assert_eq!(a_link.depth, 1);
        let b_link = tree.storage().get_link(&team.id, b).await.unwrap().unwrap();
        assert_eq!(b_link.depth, 2);
    }

    #[tokio::test]
    async fn reparent_under_a_deeper_descendant_is_refused() {
        let (tree, team, leader) = tree_with_team().await;
        let v = ids(3);

        // leader -> a -> b -> c
        tree.upsert_link(&team.id, leader.clone(), v[0].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[0].clone(), v[1].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[1].clone(), v[2].clone(), None)
            .await
            .unwrap();

        let result = tree
            .upsert_link(&team.id, v[2].clone(), v[0].clone(), None)
            .await;
        assert!(matches!(result, Err(RecruitError::WouldCycle { .. })));
    }

    #[tokio::test]
    async fn leader_cannot_be_attached_as_a_child() {
        let (tree, team, leader) = tree_with_team().await;
        let [a] = &ids(1)[..] else { unreachable!() };

        tree.upsert_link(&team.id, leader.clone(), a.clone(), None)
            .await
            .unwrap();

        let result = tree.upsert_link(&team.id, a.clone(), leader, None).await;
        assert!(matches!(result, Err(RecruitError::LeaderAsChild)));
    }

    #[tokio::test]
    async fn upsert_updates_status_in_place() {
        let (tree, team, leader) = tree_with_team().await;
        let child = VolunteerId::generate();

        let first = tree
            .upsert_link(&team.id, leader.clone(), child.clone(), None)
            .await
            .unwrap();
        let second = tree
            .upsert_link(&team.id, leader, child, Some(LinkStatus::Onboarded))
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.status, LinkStatus::Onboarded);
        assert_eq!(tree.team_stats(&team.id).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn stats_group_by_status_and_depth() {
        let (tree, team, leader) = tree_with_team().await;
        let v = ids(3);

        tree.upsert_link(&team.id, leader.clone(), v[0].clone(), Some(LinkStatus::Active))
            .await
            .unwrap();
        tree.upsert_link(&team.id, leader, v[1].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[0].clone(), v[2].clone(), Some(LinkStatus::Active))
            .await
            .unwrap();

        let stats = tree.team_stats(&team.id).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["active"], 2);
        assert_eq!(stats.by_status["invited"], 1);
        assert_eq!(stats.by_depth[&1], 2);
        assert_eq!(stats.by_depth[&2], 1);
    }

    #[tokio::test]
    async fn adjacency_lists_children_per_parent() {
        let (tree, team, leader) = tree_with_team().await;
        let v = ids(3);

        tree.upsert_link(&team.id, leader.clone(), v[0].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, leader.clone(), v[1].clone(), None)
            .await
            .unwrap();
        tree.upsert_link(&team.id, v[0].clone(), v[2].clone(), None)
            .await
            .unwrap();

        let adjacency = tree.adjacency(&team.id).await.unwrap();
        assert_eq!(adjacency.leader, leader);
        assert_eq!(adjacency.children[&leader].len(), 2);
        assert_eq!(adjacency.children[&v[0]], vec![v[2].clone()]);
    }

    #[tokio::test]
    async fn unknown_team_is_not_found() {
        let storage = Arc::new(canvass_storage::memory::InMemoryCanvassStorage::new());
        let tree = RecruitTree::new(storage);
        let result = tree.team_stats(&TeamId::generate()).await;
        assert!(matches!(result, Err(RecruitError::TeamNotFound(_))));
    }
}
