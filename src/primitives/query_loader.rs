use std::sync::Arc;

use crate::runtime::descriptor::{ConcreteRequest, Variables};

use super::load_query::{LoadQueryOptions, PreloadedQuery, load_query};
use super::reactive::{Owner, Signal};

/// Holds the most recently loaded reference to one query.
#[derive(Clone)]
pub struct QueryLoader {
    owner: Owner,
    request: Arc<ConcreteRequest>,
    current: Signal<Option<PreloadedQuery>>,
}

fn release(query: &PreloadedQuery) {
    if query.operation().is_live() {
        query.dispose();
    } else {
        query.release_query();
    }
}

/// Creates a loader, optionally seeded with an existing reference. Whatever
/// reference is current when the owner's scope is disposed gets disposed.
pub fn create_query_loader(
    owner: &Owner,
    request: Arc<ConcreteRequest>,
    initial: Option<PreloadedQuery>,
) -> QueryLoader {
    let current = Signal::new(initial);
    let cleanup = current.clone();
    owner.scope().on_cleanup(move || {
        if let Some(query) = cleanup.get() {
            query.dispose();
        }
    });
    QueryLoader {
        owner: owner.clone(),
        request,
        current,
    }
}

impl QueryLoader {
    /// Loads a fresh reference, releasing the one it replaces.
    pub fn load(&self, variables: Variables, options: LoadQueryOptions) -> PreloadedQuery {
        let query = load_query(
            self.owner.context().environment(),
            &self.request,
            variables,
            options,
        );
        let previous = self.current.get();
        self.current.set(Some(query.clone()));
        if let Some(previous) = previous {
            release(&previous);
        }
        query
    }

    pub fn dispose_query(&self) {
        let previous = self.current.get();
        self.current.set(None);
        if let Some(previous) = previous {
            release(&previous);
        }
    }

    pub fn query(&self) -> Option<PreloadedQuery> {
        self.current.get()
    }

    pub fn signal(&self) -> &Signal<Option<PreloadedQuery>> {
        &self.current
    }
}
