//! # dispatchq
//!
//! Dispatch core for skill-constrained work assignment.
//!
//! Tasks are dispatched to qualified technicians under skill, shift,
//! capacity, and priority constraints, and tracked through a strict
//! Pending → Assigned → InProgress → Completed lifecycle with an append-only
//! audit trail of every state change. The HTTP surface and process
//! bootstrapping live outside this crate and call in through
//! [`engine::Engine`].

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod store;
