//! Scoped optimistic-concurrency persistence.
//!
//! A [`DeclarationScope`] is opened at the start of an attempt. It captures
//! the stored body and its version token, hands out the in-memory copy for
//! mutation, and commits on [`DeclarationScope::close`]:
//!
//! 1. diff the in-memory copy against the snapshot
//! 2. write the patch conditionally on the captured token
//! 3. on conflict, re-read, replay our changes on the fresh body and retry
//!
//! [`DeclarationScope::checkpoint`] runs the same commit mid-attempt and
//! continues from the stored result.
//!
//! Replaying keeps concurrent writers' changes to fields we did not touch.
//! Finalizers replay as set additions/removals, spec and status fields
//! replay only where this attempt changed them.

use std::sync::Arc;

use fleetclass_api::{Declaration, DeclarationStatus, VersionToken};
use fleetclass_names::DeclarationName;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{
    DeclarationPatch, DeclarationStore, StatusPatch, StoreError, StoredDeclaration, UpdateOutcome,
};

#[derive(Debug, Error)]
pub enum PersistError {
    /// Every conditional write lost against a concurrent writer.
    #[error("gave up committing {name} after {attempts} conflicting writes")]
    Conflict {
        name: DeclarationName,
        attempts: u32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The declaration disappeared while the attempt ran.
    #[error("declaration {0} no longer exists")]
    Gone(DeclarationName),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Nothing to write.
    Unchanged,
    Committed { version: VersionToken, attempts: u32 },
    /// The commit removed the last finalizer and the store deleted the
    /// declaration.
    Removed,
}

/// Unit of work over one declaration.
pub struct DeclarationScope {
    store: Arc<dyn DeclarationStore>,
    snapshot: Declaration,
    version: VersionToken,
    declaration: Declaration,
    max_attempts: u32,
    closed: bool,
}

impl DeclarationScope {
    /// Open a scope on `name`. Returns `None` if the declaration does not exist.
    pub async fn open(
        store: Arc<dyn DeclarationStore>,
        name: &DeclarationName,
        max_attempts: u32,
    ) -> Result<Option<Self>, PersistError> {
        let Some(stored) = store.get(name).await? else {
            return Ok(None);
        };

        Ok(Some(Self {
            store,
            snapshot: stored.declaration.clone(),
            version: stored.version,
            declaration: stored.declaration,
            max_attempts: max_attempts.max(1),
            closed: false,
        }))
    }

    pub fn declaration(&self) -> &Declaration {
        &self.declaration
    }

    pub fn declaration_mut(&mut self) -> &mut Declaration {
        &mut self.declaration
    }

    pub fn set_status(&mut self, status: DeclarationStatus) {
        self.declaration.status = status;
    }

    pub fn version(&self) -> VersionToken {
        self.version
    }

    /// Commit the changes made through this scope.
    pub async fn close(mut self) -> Result<CommitOutcome, PersistError> {
        self.closed = true;
        self.write().await.map(|(outcome, _)| outcome)
    }

    /// Commit the changes made so far and keep the scope open.
    ///
    /// On success the scope continues from the stored body, which may carry
    /// changes from concurrent writers (a new spec, a deletion marker).
    /// A checkpoint that removes the declaration closes the scope.
    pub async fn checkpoint(&mut self) -> Result<CommitOutcome, PersistError> {
        let (outcome, stored) = match self.write().await {
            Ok(written) => written,
            Err(e) => {
                self.closed = true;
                return Err(e);
            }
        };
        match stored {
            Some(stored) => {
                self.snapshot = stored.declaration.clone();
                self.declaration = stored.declaration;
                self.version = stored.version;
            }
            None if outcome == CommitOutcome::Removed => self.closed = true,
            None => {}
        }
        Ok(outcome)
    }

    async fn write(&self) -> Result<(CommitOutcome, Option<StoredDeclaration>), PersistError> {
        let name = self.snapshot.name().clone();

        let mut base = self.snapshot.clone();
        let mut target = self.declaration.clone();
        let mut version = self.version;

        for attempt in 1..=self.max_attempts {
            let patch = DeclarationPatch::diff(&base, &target);
            if patch.is_empty() {
                debug!(declaration = %name, attempt, "Nothing to commit");
                return Ok((CommitOutcome::Unchanged, None));
            }

            match self.store.update(&name, &patch, version).await {
                Ok(UpdateOutcome::Updated(stored)) => {
                    debug!(declaration = %name, version = %stored.version, attempt, "Committed");
                    let outcome = CommitOutcome::Committed {
                        version: stored.version,
                        attempts: attempt,
                    };
                    return Ok((outcome, Some(stored)));
                }
                Ok(UpdateOutcome::Removed) => return Ok((CommitOutcome::Removed, None)),
                Err(StoreError::NotFound(_)) => return Err(PersistError::Gone(name)),
                Err(e) if e.is_conflict() => {
                    warn!(declaration = %name, attempt, error = %e, "Commit conflict, rebasing");
                    let Some(latest) = self.store.get(&name).await? else {
                        return Err(PersistError::Gone(name));
                    };
                    target = rebase(&self.snapshot, &self.declaration, &latest.declaration);
                    base = latest.declaration;
                    version = latest.version;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PersistError::Conflict {
            name,
            attempts: self.max_attempts,
        })
    }
}

impl Drop for DeclarationScope {
    fn drop(&mut self) {
        if !self.closed {
            warn!(declaration = %self.snapshot.name(), "Scope dropped without commit");
        }
    }
}

/// Replay the changes between `snapshot` and `intent` on top of `latest`.
fn rebase(snapshot: &Declaration, intent: &Declaration, latest: &Declaration) -> Declaration {
    let mut rebased = latest.clone();

    for finalizer in &intent.meta.finalizers {
        if !snapshot.meta.has_finalizer(finalizer) {
            rebased.meta.add_finalizer(finalizer);
        }
    }
    for finalizer in &snapshot.meta.finalizers {
        if !intent.meta.has_finalizer(finalizer) {
            rebased.meta.remove_finalizer(finalizer);
        }
    }

    if intent.spec != snapshot.spec {
        rebased.spec = intent.spec.clone();
    }

    StatusPatch::diff(&snapshot.status, &intent.status).apply(&mut rebased.status);
    rebased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeleteOutcome, InMemoryDeclarationStore, StoredDeclaration};
    use async_trait::async_trait;
    use fleetclass_api::{
        ClassifierLabel, Condition, ConditionKind, DeclarationSpec, CLASSIFIER_FINALIZER,
    };

    fn name() -> DeclarationName {
        "prod".parse().unwrap()
    }

    async fn seeded() -> Arc<InMemoryDeclarationStore> {
        let store = Arc::new(InMemoryDeclarationStore::new());
        store
            .create(Declaration::new(
                name(),
                DeclarationSpec {
                    cluster_selector: "env=prod".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_missing_returns_none() {
        let store = Arc::new(InMemoryDeclarationStore::new());
        assert!(DeclarationScope::open(store, &name(), 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_scope_does_not_write() {
        let store = seeded().await;
        let scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        assert_eq!(scope.close().await.unwrap(), CommitOutcome::Unchanged);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_retries_after_conflict() {
        let store = seeded().await;
        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.add_finalizer(CLASSIFIER_FINALIZER);

        store.inject_conflicts(2);
        let outcome = scope.close().await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { attempts: 3, .. }));

        let stored = store.get(&name()).await.unwrap().unwrap();
        assert!(stored.declaration.meta.has_finalizer(CLASSIFIER_FINALIZER));
    }

    #[tokio::test]
    async fn test_rebase_preserves_concurrent_spec_edit() {
        let store = seeded().await;
        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        let mut status = scope.declaration().status.clone();
        status.condition = Some(Condition::new(ConditionKind::Ready, "Converged"));
        scope.set_status(status);

        // Another writer edits the spec after our snapshot.
        let current = store.get(&name()).await.unwrap().unwrap();
        let mut edited = current.declaration.clone();
        edited.spec.classifier_labels.push(ClassifierLabel {
            key: "tier".into(),
            value: "gold".into(),
        });
        store
            .update(&name(), &DeclarationPatch::diff(&current.declaration, &edited), current.version)
            .await
            .unwrap();

        scope.close().await.unwrap();

        let stored = store.get(&name()).await.unwrap().unwrap().declaration;
        assert_eq!(stored.spec.classifier_labels.len(), 1);
        assert_eq!(stored.meta.generation, 2);
        assert_eq!(stored.status.condition.unwrap().kind, ConditionKind::Ready);
    }

    struct AlwaysConflicting {
        inner: InMemoryDeclarationStore,
    }

    #[async_trait]
    impl DeclarationStore for AlwaysConflicting {
        async fn get(&self, name: &DeclarationName) -> Result<Option<StoredDeclaration>, StoreError> {
            self.inner.get(name).await
        }

        async fn list_names(&self) -> Result<Vec<DeclarationName>, StoreError> {
            self.inner.list_names().await
        }

        async fn create(&self, declaration: Declaration) -> Result<StoredDeclaration, StoreError> {
            self.inner.create(declaration).await
        }

        async fn update(
            &self,
            name: &DeclarationName,
            _patch: &DeclarationPatch,
            expected: VersionToken,
        ) -> Result<UpdateOutcome, StoreError> {
            Err(StoreError::Conflict {
                name: name.clone(),
                expected,
                actual: expected.next(),
            })
        }

        async fn delete(&self, name: &DeclarationName) -> Result<DeleteOutcome, StoreError> {
            self.inner.delete(name).await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_conflict_exhaustion_is_reported() {
        let store = AlwaysConflicting {
            inner: InMemoryDeclarationStore::new(),
        };
        store
            .create(Declaration::new(name(), DeclarationSpec::default()))
            .await
            .unwrap();
        let store: Arc<dyn DeclarationStore> = Arc::new(store);

        let mut scope = DeclarationScope::open(store, &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.add_finalizer(CLASSIFIER_FINALIZER);

        let err = scope.close().await.unwrap_err();
        assert!(matches!(err, PersistError::Conflict { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_removed_when_last_finalizer_dropped() {
        let store = seeded().await;
        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.add_finalizer(CLASSIFIER_FINALIZER);
        scope.close().await.unwrap();

        assert!(matches!(store.delete(&name()).await.unwrap(), DeleteOutcome::Pending(_)));

        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.remove_finalizer(CLASSIFIER_FINALIZER);
        assert_eq!(scope.close().await.unwrap(), CommitOutcome::Removed);
        assert!(store.get(&name()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_continues_from_stored_body() {
        let store = seeded().await;
        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.add_finalizer(CLASSIFIER_FINALIZER);

        let current = store.get(&name()).await.unwrap().unwrap();
        let mut edited = current.declaration.clone();
        edited.spec.cluster_selector = "env=staging".to_string();
        store
            .update(&name(), &DeclarationPatch::diff(&current.declaration, &edited), current.version)
            .await
            .unwrap();

        let outcome = scope.checkpoint().await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { attempts: 2, .. }));
        assert_eq!(scope.declaration().spec.cluster_selector, "env=staging");
        assert!(scope.declaration().meta.has_finalizer(CLASSIFIER_FINALIZER));

        let mut status = scope.declaration().status.clone();
        status.observed_generation = 2;
        scope.set_status(status);
        let outcome = scope.close().await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { attempts: 1, .. }));
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_after_removal_is_gone() {
        let store = seeded().await;
        let mut scope = DeclarationScope::open(store.clone(), &name(), 4).await.unwrap().unwrap();
        scope.declaration_mut().meta.add_finalizer(CLASSIFIER_FINALIZER);

        assert_eq!(store.delete(&name()).await.unwrap(), DeleteOutcome::Removed);
        assert!(matches!(scope.checkpoint().await, Err(PersistError::Gone(_))));
    }
}
