use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::cache::lock::mutex_lock;
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;

use super::query::QueryResult;
use super::suspense::SuspenseResource;

const SOURCE: &str = "resource::client_edge";

struct ClientEdgeEntry {
    results: Vec<QueryResult>,
    retention: SuspenseResource,
}

#[derive(Default)]
struct ClientEdgeState {
    entries: HashMap<String, ClientEdgeEntry>,
    retain_counts: HashMap<String, usize>,
}

/// Secondary query results started while reading a fragment, keyed by the
/// fragment identifier that needed them.
pub(crate) struct ClientEdgeQueryResults {
    state: Arc<Mutex<ClientEdgeState>>,
    temporary_retain: Duration,
}

impl ClientEdgeQueryResults {
    pub(crate) fn new(temporary_retain: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientEdgeState::default())),
            temporary_retain,
        }
    }

    pub(crate) fn get(&self, fragment_identifier: &str) -> Option<Vec<QueryResult>> {
        mutex_lock(&self.state, SOURCE, "get")
            .entries
            .get(fragment_identifier)
            .map(|entry| entry.results.clone())
    }

    /// Appends `results` and (re)arms the temporary retain for the identifier.
    pub(crate) fn record_query_results(
        &self,
        env: &dyn Environment,
        fragment_identifier: &str,
        results: Vec<QueryResult>,
    ) {
        let retention = {
            let mut state = mutex_lock(&self.state, SOURCE, "record_query_results");
            match state.entries.get_mut(fragment_identifier) {
                Some(entry) => {
                    entry.results.extend(results);
                    entry.retention.clone()
                }
                None => {
                    let retention = self.retention_for(fragment_identifier);
                    state.entries.insert(
                        fragment_identifier.to_string(),
                        ClientEdgeEntry {
                            results,
                            retention: retention.clone(),
                        },
                    );
                    retention
                }
            }
        };
        retention.temporary_retain(env);
    }

    pub(crate) fn permanent_retain(
        &self,
        env: &dyn Environment,
        fragment_identifier: &str,
    ) -> Option<Disposable> {
        let retention = mutex_lock(&self.state, SOURCE, "permanent_retain")
            .entries
            .get(fragment_identifier)
            .map(|entry| entry.retention.clone())?;
        Some(retention.permanent_retain(env))
    }

    fn retention_for(&self, fragment_identifier: &str) -> SuspenseResource {
        let state: Weak<Mutex<ClientEdgeState>> = Arc::downgrade(&self.state);
        let identifier = fragment_identifier.to_string();
        SuspenseResource::new(
            move |_env: &dyn Environment| {
                let Some(shared) = state.upgrade() else {
                    return Disposable::noop();
                };
                *mutex_lock(&shared, SOURCE, "retain")
                    .retain_counts
                    .entry(identifier.clone())
                    .or_default() += 1;
                let state = state.clone();
                let identifier = identifier.clone();
                Disposable::new(move || {
                    let Some(shared) = state.upgrade() else {
                        return;
                    };
                    let mut guard = mutex_lock(&shared, SOURCE, "release");
                    let remaining = guard
                        .retain_counts
                        .get(&identifier)
                        .map_or(0, |count| count.saturating_sub(1));
                    if remaining > 0 {
                        guard.retain_counts.insert(identifier.clone(), remaining);
                    } else {
                        guard.retain_counts.remove(&identifier);
                        guard.entries.remove(&identifier);
                        debug!(
                            target_module = SOURCE,
                            fragment = %identifier,
                            "Released client edge query results"
                        );
                    }
                })
            },
            self.temporary_retain,
        )
    }
}
