//! Resilience patterns for the shared store.
//!
//! # Components
//! - `backoff.rs`: delay before retrying an unreachable store
//!
//! # Design Decisions
//! - Backoff uses exponential + jitter to avoid thundering herd
//! - The store wrapper (`store::resilient`) owns the retry schedule;
//!   this module only computes delays

pub mod backoff;
