//! Declaration store interface.
//!
//! The store is the only durable state the controller writes. It exposes:
//! - Reads returning the body together with a version token
//! - Conditional writes ("apply only if the stored version still equals the
//!   token") expressed as a [`DeclarationPatch`]
//! - Deletion with finalizer semantics: a declaration carrying finalizers is
//!   only marked for deletion and stays visible until the last finalizer is
//!   removed
//!
//! Two backends implement it: [`InMemoryDeclarationStore`] and the Postgres
//! store in `crate::db`.

mod memory;

pub use memory::InMemoryDeclarationStore;

use async_trait::async_trait;
use fleetclass_api::{
    Condition, Declaration, DeclarationSpec, DeclarationStatus, MemberInfo, MemberMatchStatus,
    VersionToken,
};
use fleetclass_names::DeclarationName;
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("declaration {0} not found")]
    NotFound(DeclarationName),

    #[error("declaration {0} already exists")]
    AlreadyExists(DeclarationName),

    /// The precondition of a conditional write failed.
    #[error("version conflict on {name}: expected {expected}, stored {actual}")]
    Conflict {
        name: DeclarationName,
        expected: VersionToken,
        actual: VersionToken,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored body could not be decoded.
    #[error("stored declaration is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A declaration as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDeclaration {
    pub declaration: Declaration,
    pub version: VersionToken,
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(StoredDeclaration),
    /// The update cleared the last finalizer of a declaration pending
    /// deletion, and the store removed it.
    Removed,
}

/// Result of a deletion request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Removed,
    /// Finalizers are present; the declaration is marked and stays visible.
    Pending(StoredDeclaration),
}

/// Changes to individual status fields.
///
/// `None` means "leave as stored".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub observed_generation: Option<i64>,
    pub matching_cluster_statuses: Option<Vec<MemberMatchStatus>>,
    pub cluster_info: Option<Vec<MemberInfo>>,
    pub condition: Option<Option<Condition>>,
}

impl StatusPatch {
    /// Fields of `after` that differ from `before`.
    pub fn diff(before: &DeclarationStatus, after: &DeclarationStatus) -> Self {
        Self {
            observed_generation: (before.observed_generation != after.observed_generation)
                .then_some(after.observed_generation),
            matching_cluster_statuses: (before.matching_cluster_statuses
                != after.matching_cluster_statuses)
                .then(|| after.matching_cluster_statuses.clone()),
            cluster_info: (before.cluster_info != after.cluster_info)
                .then(|| after.cluster_info.clone()),
            condition: (before.condition != after.condition).then(|| after.condition.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observed_generation.is_none()
            && self.matching_cluster_statuses.is_none()
            && self.cluster_info.is_none()
            && self.condition.is_none()
    }

    pub fn apply(&self, status: &mut DeclarationStatus) {
        if let Some(generation) = self.observed_generation {
            status.observed_generation = generation;
        }
        if let Some(statuses) = &self.matching_cluster_statuses {
            status.matching_cluster_statuses = statuses.clone();
        }
        if let Some(info) = &self.cluster_info {
            status.cluster_info = info.clone();
        }
        if let Some(condition) = &self.condition {
            status.condition = condition.clone();
        }
    }
}

/// Minimal set of changes between two revisions of a declaration.
///
/// Finalizers, spec and status diff independently so that a writer touching
/// only one of them never overwrites the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclarationPatch {
    pub finalizers: Option<Vec<String>>,
    pub spec: Option<DeclarationSpec>,
    pub status: Option<StatusPatch>,
}

impl DeclarationPatch {
    pub fn diff(before: &Declaration, after: &Declaration) -> Self {
        let status = StatusPatch::diff(&before.status, &after.status);
        Self {
            finalizers: (before.meta.finalizers != after.meta.finalizers)
                .then(|| after.meta.finalizers.clone()),
            spec: (before.spec != after.spec).then(|| after.spec.clone()),
            status: (!status.is_empty()).then_some(status),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_none() && self.spec.is_none() && self.status.is_none()
    }

    /// Applies the patch the way every store must: the generation is bumped
    /// when the spec actually changes.
    pub fn apply_to(&self, declaration: &mut Declaration) {
        if let Some(finalizers) = &self.finalizers {
            declaration.meta.finalizers = finalizers.clone();
        }
        if let Some(spec) = &self.spec {
            if &declaration.spec != spec {
                declaration.spec = spec.clone();
                declaration.meta.generation += 1;
            }
        }
        if let Some(status) = &self.status {
            status.apply(&mut declaration.status);
        }
    }
}

/// Returns true if a declaration pending deletion has no finalizers left.
pub(crate) fn ready_for_removal(declaration: &Declaration) -> bool {
    declaration.meta.is_deleting() && declaration.meta.finalizers.is_empty()
}

/// Durable storage for declarations.
#[async_trait]
pub trait DeclarationStore: Send + Sync {
    /// Read a declaration and its current version token.
    async fn get(&self, name: &DeclarationName) -> Result<Option<StoredDeclaration>, StoreError>;

    /// List the names of all stored declarations, sorted.
    async fn list_names(&self) -> Result<Vec<DeclarationName>, StoreError>;

    /// Store a new declaration. Status and deletion marker are reset.
    async fn create(&self, declaration: Declaration) -> Result<StoredDeclaration, StoreError>;

    /// Apply `patch` only if the stored version equals `expected`.
    async fn update(
        &self,
        name: &DeclarationName,
        patch: &DeclarationPatch,
        expected: VersionToken,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Request deletion.
    async fn delete(&self, name: &DeclarationName) -> Result<DeleteOutcome, StoreError>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<(), StoreError>;
}
