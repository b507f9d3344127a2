//! Error types for object validation.

use fleetclass_names::{DeclarationName, MemberId};
use thiserror::Error;

/// Errors raised when an object read from a member does not fit the
/// declaration it was fetched for.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A report was written by a different member than the one queried.
    #[error("report belongs to member {actual}, expected {expected}")]
    MemberMismatch { expected: MemberId, actual: MemberId },

    /// A report refers to a different declaration.
    #[error("report belongs to declaration {actual}, expected {expected}")]
    DeclarationMismatch {
        expected: DeclarationName,
        actual: DeclarationName,
    },

    /// A report carries a negative generation.
    #[error("report generation {0} is invalid")]
    InvalidGeneration(i64),
}
