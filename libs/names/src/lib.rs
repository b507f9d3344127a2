//! # fleetclass-names
//!
//! Validated names and typed identifiers shared by every fleetclass crate.
//!
//! ## Design Principles
//!
//! - Object names are user-controlled and follow DNS-1123 rules, so they can be
//!   used verbatim as object names on member clusters
//! - Member identities are `namespace/name` pairs, ordered by namespace first
//! - Attempt IDs are system-generated ULIDs used to correlate log lines of a
//!   single reconciliation attempt
//!
//! ## Formats
//!
//! - `DeclarationName`: `prod-clusters`, `gpu.nodes`
//! - `MemberId`: `fleet-a/cluster-01`
//! - `AttemptId`: `att_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::NameError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
