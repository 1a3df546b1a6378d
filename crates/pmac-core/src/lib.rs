//! Core engine for keeping a JSON project plan consistent with GitHub and
//! Jira.
//!
//! A sync pass runs in four stages:
//!
//! ```text
//! PlanStore::load ──> reconcile ──> resolve ──> execute ──> PlanStore::save
//!       │                 │             │           │
//!   validated         Change /      Strategy    TrackerAdapter calls,
//!   entities          Conflict                  MappingTable commits
//! ```
//!
//! [`engine::SyncEngine`] wires the stages together.

pub mod config;
pub mod engine;
pub mod executor;
pub mod hash;
pub mod mapping;
pub mod plan;
pub mod reconcile;
pub mod resolve;
pub mod retry;
pub mod tracker;
