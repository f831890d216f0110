//! Core configuration threaded into the activity ledger and service facade.
//!
//! These were environment-driven toggles in earlier deployments; they are an
//! explicit value now so tests can vary them per case.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// When false the ledger records activities but never promotes.
    pub auto_promotion_enabled: bool,
    /// Upper clamp for a single activity's quantity.
    pub max_activity_quantity: u32,
    /// Total activities required before an early-arc volunteer becomes active.
    pub activate_threshold: u64,
    /// Total activities required before an active volunteer becomes an owner.
    pub owner_threshold: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            auto_promotion_enabled: true,
            max_activity_quantity: 10_000,
            activate_threshold: 1,
            owner_threshold: 5,
        }
    }
}
