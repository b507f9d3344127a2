//! # fleetclass-api
//!
//! Object model for fleet classification.
//!
//! ## Objects
//!
//! - [`Declaration`]: the central object. Its spec selects member clusters and
//!   carries the classification rules; its status records, per member, the
//!   match result and the health of the propagated agent artifact
//! - [`Report`]: produced by the agent running on a member, read-only here
//! - [`AgentArtifact`]: what the controller writes on each matched member
//! - [`Member`]: a catalog entry describing a member cluster
//!
//! ## Metadata
//!
//! Every stored declaration carries [`ObjectMeta`]. The store bumps
//! `generation` whenever the spec changes and hands out a [`VersionToken`] for
//! every stored revision; writers use that token as a precondition.

mod error;
mod meta;
mod types;

pub use error::ApiError;
pub use meta::*;
pub use types::*;
