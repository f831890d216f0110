//! Canvass unified storage abstractions.
//!
//! This crate defines the storage contract the domain components rely on:
//! - volunteer records (system of record for the trust progression)
//! - immutable activity records with idempotency-token lookup
//! - approval requests with an exactly-once finalize primitive
//! - recruitment teams/links keyed by (team, child)
//! - an append-only, hash-linked stage-change audit chain
//!
//! Design stance: uniqueness constraints live in the backend and are the
//! final arbiter against races. Domain code may check "does it already
//! exist" first, but a losing concurrent writer receives
//! [`StorageError::Conflict`] and must re-fetch rather than crash.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
mod traits;

pub use error::{StorageError, StorageResult};
pub use model::{StageAuditAppend, StageAuditRecord};
pub use traits::{
    ActivityStore, CanvassStorage, QueryWindow, RequestFilter, RequestStore, StageAuditStore,
    TeamStore, VolunteerStore,
};
