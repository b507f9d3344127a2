//! Fleet classification controller.
//!
//! Propagates classification declarations to member clusters, collects the
//! per-member evaluation reports and commits the aggregated status back to
//! the declaration store with optimistic concurrency.
//!
//! The crate ships the `classifier-controller` binary; the library surface
//! exists for integration tests and embedding.

pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod fleet;
pub mod state;
pub mod store;
