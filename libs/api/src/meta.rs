//! Object metadata and version tokens.

use chrono::{DateTime, Utc};
use fleetclass_names::DeclarationName;
use serde::{Deserialize, Serialize};

/// Finalizer the controller places on every declaration it reconciles.
///
/// While present, the store keeps a deleted declaration visible so that the
/// agent artifacts can be withdrawn from every member first.
pub const CLASSIFIER_FINALIZER: &str = "classifierfinalizer.projectsveltos.io";

/// Opaque token identifying one stored revision of an object.
///
/// Two tokens compare equal only if they identify the same revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(i64);

impl VersionToken {
    /// Token of the first stored revision.
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Token the store hands out for the revision after this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata common to stored declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: DeclarationName,

    /// Spec generation. Starts at 1 and is bumped by the store on every
    /// spec change.
    #[serde(default = "initial_generation")]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set when deletion was requested while finalizers were present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

fn initial_generation() -> i64 {
    1
}

impl ObjectMeta {
    pub fn new(name: DeclarationName) -> Self {
        Self {
            name,
            generation: initial_generation(),
            finalizers: Vec::new(),
            deletion_requested_at: None,
        }
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds a finalizer. Returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes a finalizer. Returns false if it was not present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMeta {
        ObjectMeta::new("prod".parse().unwrap())
    }

    #[test]
    fn test_finalizer_add_is_idempotent() {
        let mut meta = meta();
        assert!(meta.add_finalizer(CLASSIFIER_FINALIZER));
        assert!(!meta.add_finalizer(CLASSIFIER_FINALIZER));
        assert_eq!(meta.finalizers.len(), 1);
    }

    #[test]
    fn test_finalizer_remove() {
        let mut meta = meta();
        meta.add_finalizer(CLASSIFIER_FINALIZER);
        assert!(meta.remove_finalizer(CLASSIFIER_FINALIZER));
        assert!(!meta.remove_finalizer(CLASSIFIER_FINALIZER));
        assert!(!meta.has_finalizer(CLASSIFIER_FINALIZER));
    }

    #[test]
    fn test_meta_defaults_from_json() {
        let meta: ObjectMeta = serde_json::from_str(r#"{"name":"prod"}"#).unwrap();
        assert_eq!(meta.generation, 1);
        assert!(meta.finalizers.is_empty());
        assert!(!meta.is_deleting());
    }

    #[test]
    fn test_version_token_next() {
        assert_eq!(VersionToken::INITIAL.next(), VersionToken::new(2));
        assert_eq!(serde_json::to_string(&VersionToken::new(7)).unwrap(), "7");
    }
}
