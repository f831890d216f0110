//! Stage - the volunteer lifecycle ladder.
//!
//! Early-arc stages are freely auto-assigned by the activity ledger; gated
//! stages are reachable only through an approved request and always arrive
//! locked. Rendering follows the organizing convention: earned stages in
//! lowercase, gated stages in uppercase.

use crate::ValidationError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Just registered, no recorded contribution yet.
    Newcomer,
    /// Showed up once but has not committed (newcomer variant).
    Curious,
    /// At least one recorded activity.
    Active,
    /// Sustained contributor (five or more recorded activities).
    Owner,
    /// Gated: member of an organizing team.
    Team,
    /// Gated: entrusted with fundraising.
    Fundraising,
    /// Gated: leads a team of their own.
    Leader,
    /// Gated: administrative access.
    Admin,
}

impl Stage {
    /// Gated stages require a reviewed approval and always carry the lock.
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            Stage::Team | Stage::Fundraising | Stage::Leader | Stage::Admin
        )
    }

    /// Newcomer variants: the entry stages before any promotion fired.
    pub fn is_early_arc(&self) -> bool {
        matches!(self, Stage::Newcomer | Stage::Curious)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Newcomer => "newcomer",
            Stage::Curious => "curious",
            Stage::Active => "active",
            Stage::Owner => "owner",
            Stage::Team => "TEAM",
            Stage::Fundraising => "FUNDRAISING",
            Stage::Leader => "LEADER",
            Stage::Admin => "ADMIN",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "newcomer" => Ok(Stage::Newcomer),
            "curious" => Ok(Stage::Curious),
            "active" => Ok(Stage::Active),
            "owner" => Ok(Stage::Owner),
            "team" => Ok(Stage::Team),
            "fundraising" => Ok(Stage::Fundraising),
            "leader" => Ok(Stage::Leader),
            "admin" => Ok(Stage::Admin),
            other => Err(ValidationError::UnknownStage(other.to_string())),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
