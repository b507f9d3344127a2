//! In-memory declaration store.
//!
//! Same semantics as the Postgres store. Also supports fault injection
//! (forced conflicts, unavailability) for exercising the commit path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fleetclass_api::{Declaration, DeclarationStatus, VersionToken};
use fleetclass_names::DeclarationName;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    ready_for_removal, DeclarationPatch, DeclarationStore, DeleteOutcome, StoreError,
    StoredDeclaration, UpdateOutcome,
};

/// Declaration store backed by a map.
#[derive(Default)]
pub struct InMemoryDeclarationStore {
    objects: RwLock<BTreeMap<DeclarationName, StoredDeclaration>>,

    /// Updates still to be rejected as if a concurrent writer got there first.
    injected_conflicts: AtomicU32,

    unavailable: AtomicBool,

    /// Successful conditional writes, for assertions.
    writes: AtomicU32,
}

impl InMemoryDeclarationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` updates fail with a conflict. Each injected
    /// conflict bumps the stored version like a real concurrent write would.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Toggle whether every operation fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful conditional writes so far.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DeclarationStore for InMemoryDeclarationStore {
    async fn get(&self, name: &DeclarationName) -> Result<Option<StoredDeclaration>, StoreError> {
        self.check_available()?;
        Ok(self.objects.read().await.get(name).cloned())
    }

    async fn list_names(&self) -> Result<Vec<DeclarationName>, StoreError> {
        self.check_available()?;
        Ok(self.objects.read().await.keys().cloned().collect())
    }

    async fn create(&self, declaration: Declaration) -> Result<StoredDeclaration, StoreError> {
        self.check_available()?;
        let mut objects = self.objects.write().await;
        let name = declaration.name().clone();
        if objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut declaration = declaration;
        declaration.meta.generation = 1;
        declaration.meta.deletion_requested_at = None;
        declaration.status = DeclarationStatus::default();

        let stored = StoredDeclaration {
            declaration,
            version: VersionToken::INITIAL,
        };
        objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        name: &DeclarationName,
        patch: &DeclarationPatch,
        expected: VersionToken,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(name) else {
            return Err(StoreError::NotFound(name.clone()));
        };

        if self.take_injected_conflict() {
            stored.version = stored.version.next();
            debug!(declaration = %name, version = %stored.version, "Injected concurrent write");
        }

        if stored.version != expected {
            return Err(StoreError::Conflict {
                name: name.clone(),
                expected,
                actual: stored.version,
            });
        }

        patch.apply_to(&mut stored.declaration);
        stored.version = stored.version.next();
        self.writes.fetch_add(1, Ordering::SeqCst);

        if ready_for_removal(&stored.declaration) {
            objects.remove(name);
            debug!(declaration = %name, "Last finalizer removed, declaration deleted");
            return Ok(UpdateOutcome::Removed);
        }

        Ok(UpdateOutcome::Updated(stored.clone()))
    }

    async fn delete(&self, name: &DeclarationName) -> Result<DeleteOutcome, StoreError> {
        self.check_available()?;
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(name) else {
            return Err(StoreError::NotFound(name.clone()));
        };

        if stored.declaration.meta.finalizers.is_empty() {
            objects.remove(name);
            return Ok(DeleteOutcome::Removed);
        }

        if stored.declaration.meta.deletion_requested_at.is_none() {
            stored.declaration.meta.deletion_requested_at = Some(Utc::now());
            stored.version = stored.version.next();
        }
        Ok(DeleteOutcome::Pending(stored.clone()))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
