//! Application state shared across request handlers.

use std::sync::Arc;

use crate::fleet::MemberCatalog;
use crate::store::DeclarationStore;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn DeclarationStore>,
    catalog: Arc<dyn MemberCatalog>,
}

impl AppState {
    pub fn new(store: Arc<dyn DeclarationStore>, catalog: Arc<dyn MemberCatalog>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { store, catalog }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DeclarationStore> {
        &self.inner.store
    }

    pub fn catalog(&self) -> &Arc<dyn MemberCatalog> {
        &self.inner.catalog
    }
}
